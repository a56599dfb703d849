//! Event logging for constants detection and decoding.
//!
//! Every decision the engine makes is recorded as an [`Event`]: which routine was taken for the
//! decompressor, which candidates were rejected as decoys and why, and every decode performed
//! against a detected engine. Events can be inspected for debugging or safely ignored.
//!
//! # Architecture
//!
//! The system is built around three main types:
//!
//! - [`Event`] - A single recorded event
//! - [`EventLog`] - Append-only collection of events with query and summary capabilities,
//!   drained with [`EventLog::take`]
//! - [`EventBuilder`] - Fluent API for creating events
//!
//! # Example
//!
//! ```rust
//! use confuserex_constants::{
//!     deobfuscation::{EventKind, EventLog},
//!     metadata::token::Token,
//! };
//!
//! let log = EventLog::new();
//!
//! log.record(EventKind::StringDecrypted)
//!     .method(Token::new(0x0600_0004))
//!     .index(0x2A)
//!     .message("decrypted: \"hello world\"");
//! log.warn("no decryptor methods recognized");
//!
//! assert_eq!(log.len(), 2);
//! assert_eq!(log.summary(), "1 string decrypted");
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use crate::metadata::token::Token;

/// Categories of events that can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The LZMA decompression routine was located.
    DecompressorLocated,
    /// The initializer that fills the constants buffer was identified.
    InitializerFound,
    /// The decrypted constants blob was materialized.
    BlobExtracted,
    /// A method was identified as a constants decryptor.
    DecryptorIdentified,
    /// A method with decryptor shape was rejected.
    DecoyRejected,

    /// A string was decrypted.
    StringDecrypted,
    /// A primitive constant was decrypted.
    ConstantDecrypted,
    /// An array was decrypted.
    ArrayDecrypted,

    /// Constants detection completed.
    DetectionComplete,

    /// Informational message.
    Info,
    /// Warning (something unexpected but recoverable).
    Warning,
    /// Error (something failed).
    Error,
}

impl EventKind {
    /// Returns a human-readable description of this event kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            // Detection
            Self::DecompressorLocated => "decompressor located",
            Self::InitializerFound => "initializer found",
            Self::BlobExtracted => "blob extracted",
            Self::DecryptorIdentified => "decryptor identified",
            Self::DecoyRejected => "decoy rejected",
            // Decoding
            Self::StringDecrypted => "string decrypted",
            Self::ConstantDecrypted => "constant decrypted",
            Self::ArrayDecrypted => "array decrypted",
            // Engine
            Self::DetectionComplete => "detection complete",
            // Diagnostic
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Returns true if this event records a decoded value.
    #[must_use]
    pub fn is_decryption(&self) -> bool {
        matches!(
            self,
            Self::StringDecrypted | Self::ConstantDecrypted | Self::ArrayDecrypted
        )
    }

    /// Returns true if this is a diagnostic event (info/warning/error).
    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Self::Info | Self::Warning | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A single logged event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The type of event.
    pub kind: EventKind,
    /// The method the event is about (if applicable).
    pub method: Option<Token>,
    /// The call-site index being decoded (if applicable).
    pub index: Option<u32>,
    /// Human-readable description.
    pub message: String,
}

impl Event {
    fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            method: None,
            index: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(method) = self.method {
            write!(f, " {method}")?;
        }
        if let Some(index) = self.index {
            write!(f, " #{index:#x}")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Builder for creating events with a fluent API.
///
/// Created by [`EventLog::record`]. The event is automatically added
/// to the log when the builder is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    kind: EventKind,
    method: Option<Token>,
    index: Option<u32>,
    message: Option<String>,
}

impl<'a> EventBuilder<'a> {
    fn new(log: &'a EventLog, kind: EventKind) -> Self {
        Self {
            log,
            kind,
            method: None,
            index: None,
            message: None,
        }
    }

    /// Sets the method the event is about.
    pub fn method(mut self, method: Token) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the call-site index.
    pub fn index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Sets a custom message describing the event.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        let message = self
            .message
            .take()
            .unwrap_or_else(|| self.kind.description().to_string());

        self.log.events.push(Event {
            kind: self.kind,
            method: self.method.take(),
            index: self.index.take(),
            message,
        });
    }
}

/// Collection of events from constants detection and decoding.
///
/// This type is thread-safe: events can be appended concurrently from
/// multiple threads using shared references (`&self`), which is what lets
/// decodes against a shared engine log without locking.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let new_log = Self::new();
        new_log.merge(self);
        new_log
    }
}

impl EventLog {
    /// Creates an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }

    /// Returns true if no events have been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Returns the total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts building a new event of the given kind.
    ///
    /// The event is automatically added when the builder is dropped.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder::new(self, kind)
    }

    /// Records an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Info, message));
    }

    /// Records a warning message.
    pub fn warn(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Warning, message));
    }

    /// Records an error message.
    pub fn error(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Error, message));
    }

    /// Moves every event out, leaving the log empty.
    ///
    /// Long-running decoders call this between batches to keep the log bounded.
    pub fn take(&mut self) -> EventLog {
        std::mem::take(self)
    }

    /// Appends copies of all events of `other`.
    pub fn merge(&self, other: &EventLog) {
        for (_, event) in &other.events {
            self.events.push(event.clone());
        }
    }

    /// Returns true if any event of the given kind exists.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.events.iter().any(|(_, e)| e.kind == kind)
    }

    /// Counts events of the given kind.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|(_, e)| e.kind == kind).count()
    }

    /// Returns an iterator over all events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Returns an iterator over events of a specific kind.
    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.events
            .iter()
            .filter_map(move |(_, e)| if e.kind == kind { Some(e) } else { None })
    }

    /// Returns an iterator over events for a specific method.
    pub fn filter_method(&self, method: Token) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter_map(move |(_, e)| {
            if e.method == Some(method) {
                Some(e)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over warning events.
    pub fn warnings(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Warning)
    }

    /// Returns an iterator over error events.
    pub fn errors(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Error)
    }

    /// Counts events grouped by kind.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let mut counts = HashMap::new();
        for (_, event) in &self.events {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the number of unique methods with events.
    #[must_use]
    pub fn methods_affected(&self) -> usize {
        self.events
            .iter()
            .filter_map(|(_, e)| e.method)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Generates a human-readable summary of the decoded values.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no events".to_string();
        }

        let mut parts: Vec<String> = self
            .count_by_kind()
            .iter()
            .filter(|(k, _)| k.is_decryption())
            .map(|(kind, count)| format!("{} {}", count, kind.description()))
            .collect();

        if parts.is_empty() {
            return format!("{} events", self.len());
        }

        parts.sort();
        parts.join(", ")
    }
}

/// Iterator wrapper for EventLog that yields &Event
pub struct EventLogIter<'a> {
    inner: boxcar::Iter<'a, Event>,
}

impl<'a> Iterator for EventLogIter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, e)| e)
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a Event;
    type IntoIter = EventLogIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        EventLogIter {
            inner: self.events.iter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_appends_on_drop() {
        let log = EventLog::new();
        assert!(log.is_empty());

        log.record(EventKind::DecoyRejected)
            .method(Token::new(0x0600_0007))
            .message("fewer than 25 instructions");
        log.record(EventKind::DecryptorIdentified);

        assert_eq!(log.len(), 2);
        let rejected = log.filter_kind(EventKind::DecoyRejected).next().unwrap();
        assert_eq!(rejected.method, Some(Token::new(0x0600_0007)));
        assert_eq!(rejected.message, "fewer than 25 instructions");

        let identified = log.filter_kind(EventKind::DecryptorIdentified).next().unwrap();
        assert_eq!(identified.message, "decryptor identified");
    }

    #[test]
    fn test_queries_and_summary() {
        let log = EventLog::new();
        let site = Token::new(0x0600_0003);
        log.record(EventKind::StringDecrypted).method(site).index(1);
        log.record(EventKind::StringDecrypted).method(site).index(2);
        log.record(EventKind::ArrayDecrypted).method(Token::new(0x0600_0004));
        log.warn("suspicious");

        assert!(log.has(EventKind::Warning));
        assert!(EventKind::Warning.is_diagnostic());
        assert!(!EventKind::StringDecrypted.is_diagnostic());
        assert!(!log.has(EventKind::Error));
        assert_eq!(log.count_kind(EventKind::StringDecrypted), 2);
        assert_eq!(log.filter_method(site).count(), 2);
        assert_eq!(log.methods_affected(), 2);
        assert_eq!(log.warnings().count(), 1);
        assert_eq!(log.summary(), "1 array decrypted, 2 string decrypted");
        assert_eq!((&log).into_iter().count(), 4);
    }

    #[test]
    fn test_clone_and_display() {
        let log = EventLog::new();
        log.record(EventKind::StringDecrypted)
            .method(Token::new(0x0600_0002))
            .index(0x10)
            .message("\"a\"");
        log.info("done");

        let copy = log.clone();
        assert_eq!(copy.len(), 2);
        assert_eq!(
            copy.iter().next().unwrap().to_string(),
            "[string decrypted] 0x06000002 #0x10 \"a\""
        );
        assert_eq!(EventLog::new().summary(), "no events");
    }

    #[test]
    fn test_take_empties_the_log() {
        let mut log = EventLog::new();
        log.record(EventKind::StringDecrypted).index(1);
        log.warn("kept in the taken half");

        let taken = log.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken.warnings().count(), 1);
        assert!(log.is_empty());

        log.record(EventKind::ArrayDecrypted);
        assert_eq!(log.len(), 1);
        assert_eq!(taken.len(), 2);
    }

    #[test]
    fn test_concurrent_recording() {
        let log = EventLog::new();
        std::thread::scope(|scope| {
            for thread in 0..4u32 {
                let log = &log;
                scope.spawn(move || {
                    for index in 0..25 {
                        log.record(EventKind::ConstantDecrypted).index(thread * 100 + index);
                    }
                });
            }
        });
        assert_eq!(log.count_kind(EventKind::ConstantDecrypted), 100);
    }
}
