// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Reply framing for the mount command protocol. Replies are not uniformly
// delimited: some commands answer nothing, some a single unterminated
// character, and the rest a '#'-terminated string. The class of each
// sub-command determines how many bytes of the reply belong to it.

use std::borrow::Cow;

use canonical_error::{internal_error, CanonicalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// No reply.
    NoReply,
    /// Exactly one character, not '#'-terminated.
    SingleChar,
    /// Variable length, '#'-terminated.
    Terminated,
}

impl CommandClass {
    /// Number of reply chunks this class contributes.
    pub fn reply_chunks(&self) -> usize {
        match self {
            CommandClass::NoReply => 0,
            CommandClass::SingleChar | CommandClass::Terminated => 1,
        }
    }
}

// Sorted by descending prefix length so the first match is the longest
// one. Anything not listed is CommandClass::Terminated.
static PREFIX_TABLE: &[(&str, CommandClass)] = &[
    ("shutdown", CommandClass::SingleChar),
    ("TSOLAR", CommandClass::NoReply),
    ("GTMPLT", CommandClass::SingleChar),
    ("GTTRK", CommandClass::SingleChar),
    ("SRPRS", CommandClass::SingleChar),
    ("SRTMP", CommandClass::SingleChar),
    ("FLIP", CommandClass::SingleChar),
    ("GREF", CommandClass::SingleChar),
    ("GTRK", CommandClass::SingleChar),
    ("GTsid", CommandClass::SingleChar),
    ("Guaf", CommandClass::SingleChar),
    ("SREF", CommandClass::SingleChar),
    ("Sdat", CommandClass::SingleChar),
    ("Gdat", CommandClass::SingleChar),
    ("Slmt", CommandClass::SingleChar),
    ("Slms", CommandClass::SingleChar),
    ("STOP", CommandClass::NoReply),
    ("Suaf", CommandClass::NoReply),
    ("GSC", CommandClass::SingleChar),
    ("Sev", CommandClass::SingleChar),
    ("RT0", CommandClass::NoReply),
    ("RT1", CommandClass::NoReply),
    ("RT2", CommandClass::NoReply),
    ("RT9", CommandClass::NoReply),
    ("AP", CommandClass::NoReply),
    ("AL", CommandClass::NoReply),
    ("hP", CommandClass::NoReply),
    ("PO", CommandClass::NoReply),
    ("U2", CommandClass::NoReply),
    ("hS", CommandClass::NoReply),
    ("hF", CommandClass::NoReply),
    ("KA", CommandClass::NoReply),
    ("Me", CommandClass::NoReply),
    ("Mn", CommandClass::NoReply),
    ("Ms", CommandClass::NoReply),
    ("Mw", CommandClass::NoReply),
    ("EW", CommandClass::NoReply),
    ("NS", CommandClass::NoReply),
    ("TQ", CommandClass::NoReply),
    ("MA", CommandClass::SingleChar),
    ("MS", CommandClass::SingleChar),
    ("Sa", CommandClass::SingleChar),
    ("Sd", CommandClass::SingleChar),
    ("Sr", CommandClass::SingleChar),
    ("St", CommandClass::SingleChar),
    ("Sw", CommandClass::SingleChar),
    ("Sz", CommandClass::SingleChar),
    ("Q", CommandClass::NoReply),
];

/// Classifies one sub-command. Leading ':' is ignored.
pub fn classify(command: &str) -> CommandClass {
    let command = command.trim_start_matches(':');
    for (prefix, class) in PREFIX_TABLE {
        if command.starts_with(prefix) {
            return *class;
        }
    }
    CommandClass::Terminated
}

/// Splits a pipelined command such as ":GS#:Ginfo#" into its sub-commands
/// (without ':' and '#').
pub fn split_commands(command: &str) -> Vec<&str> {
    command.split('#')
        .map(|c| c.trim_start_matches(':'))
        .filter(|c| !c.is_empty())
        .collect()
}

/// Classes of each sub-command of a pipelined command, in order.
pub fn classify_all(command: &str) -> Vec<CommandClass> {
    split_commands(command).iter().map(|c| classify(c)).collect()
}

/// Summary of what the reply to a pipelined command looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyExpectation {
    /// Number of reply chunks (SingleChar + Terminated count).
    pub chunks: usize,
    /// Whether any sub-command is SingleChar.
    pub has_single_char: bool,
}

pub fn expectation(command: &str) -> ReplyExpectation {
    let classes = classify_all(command);
    ReplyExpectation {
        chunks: classes.iter().map(|c| c.reply_chunks()).sum(),
        has_single_char: classes.contains(&CommandClass::SingleChar),
    }
}

/// Reply to a pipelined command, split per replying sub-command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// The bytes received, verbatim.
    pub raw: String,
    /// One entry per replying sub-command, '#' stripped.
    pub chunks: Vec<String>,
}

impl Reply {
    pub fn chunk(&self, i: usize) -> Option<&str> {
        self.chunks.get(i).map(|s| s.as_str())
    }

    pub fn last_chunk(&self) -> Option<&str> {
        self.chunks.last().map(|s| s.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Incomplete,
    Complete(Reply),
}

/// Accumulates reply bytes for one pipelined command and decides when the
/// reply is complete. Sub-replies are consumed in command order: a
/// SingleChar sub-command takes exactly one character, a Terminated
/// sub-command takes everything up to and including the next '#'.
#[derive(Debug)]
pub struct ReplyFramer {
    classes: Vec<CommandClass>,
    buffer: Vec<u8>,
}

impl ReplyFramer {
    pub fn new(command: &str) -> Self {
        ReplyFramer {
            classes: classify_all(command)
                .into_iter()
                .filter(|c| *c != CommandClass::NoReply)
                .collect(),
            buffer: Vec::new(),
        }
    }

    /// True if the command expects no reply at all.
    pub fn expects_nothing(&self) -> bool {
        self.classes.is_empty()
    }

    /// Bytes seen so far, for diagnostics.
    pub fn seen(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    /// Appends received bytes and re-evaluates completeness. An Err means
    /// the reply cannot match the command classes; the caller should drop the
    /// buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Result<FrameStatus, CanonicalError> {
        self.buffer.extend_from_slice(bytes);
        self.evaluate()
    }

    // Text received so far. An incomplete multibyte sequence at the end is
    // held back until the rest of it arrives.
    fn text(&self) -> Cow<'_, str> {
        match std::str::from_utf8(&self.buffer) {
            Ok(text) => Cow::Borrowed(text),
            Err(e) if e.error_len().is_none() => {
                String::from_utf8_lossy(&self.buffer[..e.valid_up_to()])
            }
            Err(_) => String::from_utf8_lossy(&self.buffer),
        }
    }

    fn evaluate(&self) -> Result<FrameStatus, CanonicalError> {
        let text = self.text();
        let mut chunks = Vec::with_capacity(self.classes.len());
        let mut rest = text.as_ref();
        for class in &self.classes {
            match class {
                CommandClass::SingleChar => {
                    let mut chars = rest.chars();
                    match chars.next() {
                        None => return Ok(FrameStatus::Incomplete),
                        Some('#') => {
                            return Err(internal_error(format!(
                                "Expected single character reply, got '#'; seen {:?}",
                                text).as_str()));
                        }
                        Some(c) => {
                            chunks.push(c.to_string());
                            rest = chars.as_str();
                        }
                    }
                }
                CommandClass::Terminated => {
                    match rest.find('#') {
                        None => return Ok(FrameStatus::Incomplete),
                        Some(pos) => {
                            chunks.push(rest[..pos].to_string());
                            rest = &rest[pos + 1..];
                        }
                    }
                }
                CommandClass::NoReply => {}
            }
        }
        if !rest.is_empty() {
            return Err(internal_error(format!(
                "Reply longer than expected for {} chunks; seen {:?}",
                self.classes.len(), text).as_str()));
        }
        Ok(FrameStatus::Complete(Reply {
            raw: text.to_string(),
            chunks,
        }))
    }
}
