use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Corrupt,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    seq: Option<u64>,
    mapping_id: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            seq: None,
            mapping_id: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_mapping_id(mut self, mapping_id: u64) -> Self {
        self.mapping_id = Some(mapping_id);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(seq) = self.seq {
            write!(f, " (seq: {seq})")?;
        }
        if let Some(mapping_id) = self.mapping_id {
            write!(f, " (mapping_id: {mapping_id})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn kind_is_preserved() {
        let err = Error::new(ErrorKind::Usage).with_message("bad geometry");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.message(), Some("bad geometry"));
    }

    #[test]
    fn display_includes_attachments() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("missing field")
            .with_seq(12)
            .with_mapping_id(40);
        let rendered = err.to_string();
        assert!(rendered.contains("Corrupt"));
        assert!(rendered.contains("missing field"));
        assert!(rendered.contains("seq: 12"));
        assert!(rendered.contains("mapping_id: 40"));
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::new(ErrorKind::Internal).with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
