use std::fmt;

/// Crate-wide fallible-operation error type.
///
/// Every public operation returns `Result<T, Error>`; callers that need to
/// match on a specific failure downcast via [`std::error::Error::source`].
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A failure writing or reading a single cgroup v2 attribute file.
///
/// Carries the attribute's name so callers don't have to re-derive it from
/// a bare `io::Error` and a path.
#[derive(Debug)]
pub struct CgroupAttrError {
    pub attr: &'static str,
    pub source: std::io::Error,
}

impl fmt::Display for CgroupAttrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cgroup attribute {}: {}", self.attr, self.source)
    }
}

impl std::error::Error for CgroupAttrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl CgroupAttrError {
    pub fn new(attr: &'static str, source: std::io::Error) -> Self {
        Self { attr, source }
    }
}

/// A container precondition was violated (e.g. starting a container that's
/// already running, or operating on one that doesn't exist).
#[derive(Debug)]
pub struct PreconditionError(pub String);

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PreconditionError {}

pub fn precondition<T>(msg: impl Into<String>) -> Result<T, Error> {
    Err(Box::new(PreconditionError(msg.into())))
}
