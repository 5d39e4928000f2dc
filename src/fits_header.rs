// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Minimal FITS primary-header editing: enough to read and inject header
// keywords around a capture. Pixel data is carried through untouched.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use canonical_error::{failed_precondition_error, internal_error, CanonicalError};
use chrono::{DateTime, Utc};

use crate::astro_util::{fits_dec_string, fits_ra_string};

pub const BLOCK_SIZE: usize = 2880;
pub const CARD_SIZE: usize = 80;

/// Arcseconds per pixel is pixel_um * SCALE_FACTOR / focal_mm.
pub const SCALE_FACTOR: f64 = 206.6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    // 80-column cards, END excluded.
    cards: Vec<String>,
}

fn card_key(card: &str) -> &str {
    card.get(..8).unwrap_or(card).trim_end()
}

fn pad_card(mut card: String) -> String {
    card.truncate(CARD_SIZE);
    while card.len() < CARD_SIZE {
        card.push(' ');
    }
    card
}

impl FitsHeader {
    pub fn cards(&self) -> &[String] {
        &self.cards
    }

    fn card(&self, key: &str) -> Option<&String> {
        self.cards.iter().find(|c| card_key(c) == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.card(key).is_some()
    }

    /// The value of `key` with quotes and comment removed.
    pub fn get(&self, key: &str) -> Option<String> {
        let card = self.card(key)?;
        if card.get(8..10) != Some("= ") {
            return None;
        }
        let value = card.get(10..).unwrap_or("").trim_start();
        if let Some(quoted) = value.strip_prefix('\'') {
            // '' inside a string is an escaped quote.
            let mut result = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        result.push('\'');
                        continue;
                    }
                    break;
                }
                result.push(c);
            }
            return Some(result.trim_end().to_string());
        }
        let value = value.split('/').next().unwrap_or("").trim();
        Some(value.to_string())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.parse::<f64>().ok()
    }

    fn set_card(&mut self, key: &str, card: String) {
        let card = pad_card(card);
        match self.cards.iter_mut().find(|c| card_key(c) == key) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str, comment: &str) {
        let quoted = format!("'{:<8}'", value.replace('\'', "''"));
        let mut card = format!("{:<8}= {:<20}", key, quoted);
        if !comment.is_empty() {
            card.push_str(&format!(" / {}", comment));
        }
        self.set_card(key, card);
    }

    pub fn set_f64(&mut self, key: &str, value: f64, comment: &str) {
        let mut card = format!("{:<8}= {:>20}", key, format_float(value));
        if !comment.is_empty() {
            card.push_str(&format!(" / {}", comment));
        }
        self.set_card(key, card);
    }

    pub fn set_i64(&mut self, key: &str, value: i64, comment: &str) {
        let mut card = format!("{:<8}= {:>20}", key, value);
        if !comment.is_empty() {
            card.push_str(&format!(" / {}", comment));
        }
        self.set_card(key, card);
    }

    pub fn set_bool(&mut self, key: &str, value: bool, comment: &str) {
        let mut card = format!("{:<8}= {:>20}", key, if value { "T" } else { "F" });
        if !comment.is_empty() {
            card.push_str(&format!(" / {}", comment));
        }
        self.set_card(key, card);
    }

    /// Scale hint derived from the header: PIXSCALE if present, otherwise
    /// computed from FOCALLEN and XPIXSZ (or PIXSIZE1).
    pub fn scale_hint(&self) -> Option<f64> {
        if let Some(scale) = self.get_f64("PIXSCALE") {
            return Some(scale);
        }
        let focal = self.get_f64("FOCALLEN")?;
        let pixel = self.get_f64("XPIXSZ").or_else(|| self.get_f64("PIXSIZE1"))?;
        if focal <= 0.0 {
            return None;
        }
        Some(pixel * SCALE_FACTOR / focal)
    }
}

fn format_float(value: f64) -> String {
    let s = format!("{:.10}", value);
    let s = s.trim_end_matches('0');
    if s.ends_with('.') {
        format!("{}0", s)
    } else {
        s.to_string()
    }
}

/// A FITS file split into its primary header and everything after it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsFile {
    pub header: FitsHeader,
    pub data: Vec<u8>,
}

impl FitsFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, CanonicalError> {
        if bytes.len() < BLOCK_SIZE || !bytes.starts_with(b"SIMPLE  =") {
            return Err(internal_error("Not a FITS file"));
        }
        let mut cards = Vec::new();
        let mut offset = 0;
        loop {
            let Some(raw) = bytes.get(offset..offset + CARD_SIZE) else {
                return Err(internal_error("FITS header has no END card"));
            };
            offset += CARD_SIZE;
            let card = String::from_utf8_lossy(raw).to_string();
            if card_key(&card) == "END" {
                break;
            }
            cards.push(card);
        }
        // Data starts at the next block boundary.
        let data_start = offset.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let data = bytes.get(data_start..).unwrap_or(&[]).to_vec();
        Ok(FitsFile { header: FitsHeader { cards }, data })
    }

    pub fn read(path: &Path) -> Result<Self, CanonicalError> {
        let bytes = fs::read(path).map_err(|e| {
            failed_precondition_error(format!("Cannot read {:?}: {}", path, e).as_str())
        })?;
        FitsFile::parse(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::new();
        for card in &self.header.cards {
            bytes.extend_from_slice(pad_card(card.clone()).as_bytes());
        }
        bytes.extend_from_slice(pad_card("END".to_string()).as_bytes());
        while bytes.len() % BLOCK_SIZE != 0 {
            bytes.push(b' ');
        }
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn write(&self, path: &Path) -> Result<(), CanonicalError> {
        fs::write(path, self.to_bytes()).map_err(|e| {
            failed_precondition_error(format!("Cannot write {:?}: {}", path, e).as_str())
        })
    }
}

/// Keywords written into each captured frame. Coordinates in degrees.
#[derive(Debug, Clone)]
pub struct FrameKeywords {
    pub date_obs: SystemTime,
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    pub ra_jnow: f64,
    pub dec_jnow: f64,
    pub local_sidereal_time: String,
    pub pier_side: char,
    pub exposure: f64,
    pub azimuth: f64,
    pub altitude: f64,
}

pub fn iso_date(time: &SystemTime) -> String {
    DateTime::<Utc>::from(*time).format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Injects `keywords` into `header` and returns the scale hint that was
/// written: the header's own if it has one, else `fallback_scale`.
pub fn inject_keywords(header: &mut FitsHeader, keywords: &FrameKeywords,
                       fallback_scale: f64) -> f64 {
    let scale = header.scale_hint().unwrap_or(fallback_scale);
    header.set_str("DATE-OBS", &iso_date(&keywords.date_obs), "UTC start of exposure");
    header.set_str("OBJCTRA", &fits_ra_string(keywords.ra_j2000), "J2000");
    header.set_str("OBJCTDEC", &fits_dec_string(keywords.dec_j2000), "J2000");
    // CDELT is degrees per pixel by convention.
    header.set_f64("CDELT1", scale / 3600.0, "deg/pixel");
    header.set_f64("CDELT2", scale / 3600.0, "deg/pixel");
    header.set_f64("PIXSCALE", scale, "arcsec/pixel");
    header.set_f64("SCALE", scale, "arcsec/pixel");
    header.set_f64("MW_MRA", keywords.ra_jnow, "mount ra JNow, deg");
    header.set_f64("MW_MDEC", keywords.dec_jnow, "mount dec JNow, deg");
    header.set_str("MW_ST", &keywords.local_sidereal_time, "local sidereal time");
    header.set_str("MW_MSIDE", &keywords.pier_side.to_string(), "pier side");
    header.set_f64("MW_EXP", keywords.exposure, "exposure, s");
    header.set_f64("MW_AZ", keywords.azimuth, "mount azimuth, deg");
    header.set_f64("MW_ALT", keywords.altitude, "mount altitude, deg");
    scale
}

/// Rewrites the file at `path` with `keywords` injected. Returns the scale
/// hint to use for solving.
pub fn inject_into_file(path: &Path, keywords: &FrameKeywords,
                        fallback_scale: f64) -> Result<f64, CanonicalError> {
    let mut fits = FitsFile::read(path)?;
    let scale = inject_keywords(&mut fits.header, keywords, fallback_scale);
    fits.write(path)?;
    Ok(scale)
}

/// Writes a 16-bit `width` x `height` image with a flat background. Stands
/// in for a captured frame in simulation.
pub fn write_reference_image(path: &Path, width: usize, height: usize)
                             -> Result<(), CanonicalError> {
    let mut header = FitsHeader::default();
    header.set_bool("SIMPLE", true, "");
    header.set_i64("BITPIX", 16, "");
    header.set_i64("NAXIS", 2, "");
    header.set_i64("NAXIS1", width as i64, "");
    header.set_i64("NAXIS2", height as i64, "");
    header.set_i64("BZERO", 32768, "");
    let mut data = Vec::with_capacity(width * height * 2);
    for _ in 0..width * height {
        // 1000 ADU above BZERO offset.
        data.extend_from_slice(&(1000_i16 - i16::MAX - 1).to_be_bytes());
    }
    while data.len() % BLOCK_SIZE != 0 {
        data.push(0);
    }
    FitsFile { header, data }.write(path)
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::time::{Duration, UNIX_EPOCH};

    use approx::assert_abs_diff_eq;

    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("fits_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_reference_image_round_trip() {
        let path = temp_path("reference.fit");
        write_reference_image(&path, 16, 8).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);
        let fits = FitsFile::parse(&bytes).unwrap();
        assert_eq!(fits.header.get("SIMPLE").unwrap(), "T");
        assert_eq!(fits.header.get_f64("NAXIS1"), Some(16.0));
        assert_eq!(fits.header.get_f64("NAXIS2"), Some(8.0));
        assert_eq!(fits.data.len(), BLOCK_SIZE);
        assert_eq!(fits.to_bytes(), bytes);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_string_values() {
        let mut header = FitsHeader::default();
        header.set_str("OBJECT", "M 31", "target");
        header.set_str("OBSERVER", "O'Brien", "");
        assert_eq!(header.get("OBJECT").unwrap(), "M 31");
        assert_eq!(header.get("OBSERVER").unwrap(), "O'Brien");
        assert!(header.cards().iter().all(|c| c.len() == CARD_SIZE));
        // Setting again replaces the card.
        header.set_str("OBJECT", "M 33", "");
        assert_eq!(header.cards().len(), 2);
        assert_eq!(header.get("OBJECT").unwrap(), "M 33");
        assert!(header.get("MISSING").is_none());
    }

    #[test]
    fn test_scale_hint() {
        let mut header = FitsHeader::default();
        assert!(header.scale_hint().is_none());
        header.set_f64("FOCALLEN", 1000.0, "");
        assert!(header.scale_hint().is_none());
        header.set_f64("PIXSIZE1", 3.8, "");
        assert_abs_diff_eq!(header.scale_hint().unwrap(), 0.78508, epsilon = 1e-5);
        header.set_f64("XPIXSZ", 5.0, "");
        assert_abs_diff_eq!(header.scale_hint().unwrap(), 1.033, epsilon = 1e-9);
        header.set_f64("PIXSCALE", 1.5, "");
        assert_abs_diff_eq!(header.scale_hint().unwrap(), 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_inject_keywords() {
        let path = temp_path("inject.fit");
        write_reference_image(&path, 4, 4).unwrap();
        let keywords = FrameKeywords {
            date_obs: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            ra_j2000: 150.0,
            dec_j2000: -20.5,
            ra_jnow: 150.3,
            dec_jnow: -20.6,
            local_sidereal_time: "10:01:02.03".to_string(),
            pier_side: 'W',
            exposure: 3.0,
            azimuth: 180.0,
            altitude: 45.0,
        };
        let scale = inject_into_file(&path, &keywords, 1.2).unwrap();
        assert_abs_diff_eq!(scale, 1.2, epsilon = 1e-9);
        let fits = FitsFile::read(&path).unwrap();
        let h = &fits.header;
        assert_eq!(h.get("DATE-OBS").unwrap(), "2023-11-14T22:13:20.000");
        assert_eq!(h.get("OBJCTRA").unwrap(), "10 00 00.00");
        assert_eq!(h.get("OBJCTDEC").unwrap(), "-20 30 00.0");
        assert_abs_diff_eq!(h.get_f64("PIXSCALE").unwrap(), 1.2, epsilon = 1e-9);
        assert_abs_diff_eq!(h.get_f64("CDELT1").unwrap(), 1.2 / 3600.0, epsilon = 1e-9);
        assert_eq!(h.get("MW_MSIDE").unwrap(), "W");
        assert_eq!(h.get("MW_ST").unwrap(), "10:01:02.03");
        assert_abs_diff_eq!(h.get_f64("MW_ALT").unwrap(), 45.0, epsilon = 1e-9);
        // Pixel data is carried through.
        assert_eq!(fits.header.get_f64("NAXIS1"), Some(4.0));
        assert_eq!(fits.data.len(), BLOCK_SIZE);

        // A second injection keeps the scale written by the first.
        let scale = inject_into_file(&path, &keywords, 9.9).unwrap();
        assert_abs_diff_eq!(scale, 1.2, epsilon = 1e-9);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rejects_non_fits() {
        assert!(FitsFile::parse(b"hello").is_err());
        let mut bytes = vec![b' '; BLOCK_SIZE];
        bytes[..9].copy_from_slice(b"SIMPLE  =");
        assert!(FitsFile::parse(&bytes).is_err());
    }
}
