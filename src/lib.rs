// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod analyse;
pub mod astro_util;
pub mod astrometry_net;
pub mod cancel;
pub mod command_class;
pub mod command_runner;
pub mod config;
pub mod core_context;
pub mod dome;
pub mod environment;
pub mod fits_header;
pub mod imaging;
pub mod model_builder;
pub mod model_point;
pub mod mount_commands;
pub mod mount_gateway;
pub mod mount_poller;
pub mod mount_state;
pub mod point_generator;
pub mod remote_server;
pub mod sgpro_imaging;
pub mod simulated_imaging;
pub mod theskyx_imaging;
pub mod wake_on_lan;
