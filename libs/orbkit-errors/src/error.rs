use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;

/// Convenience alias used across the OrbKit crates.
pub type Result<T, E = OrbError> = std::result::Result<T, E>;

type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// An error with an HTTP-style status code.
///
/// `Display` renders `"<message>"` or `"<message>: <cause>"`, so wrapping a
/// bare error into [`OrbError::INTERNAL_SERVER_ERROR`] yields
/// `"internal server error: <cause>"`.
#[derive(Clone)]
pub struct OrbError {
    code: u16,
    message: Cow<'static, str>,
    wrapped: Option<Cause>,
}

macro_rules! well_known {
    ($($(#[$doc:meta])* $name:ident = $code:literal, $msg:literal;)+) => {
        impl OrbError {
            $(
                $(#[$doc])*
                pub const $name: OrbError = OrbError {
                    code: $code,
                    message: Cow::Borrowed($msg),
                    wrapped: None,
                };
            )+
        }

        fn default_message(code: u16) -> Option<&'static str> {
            match code {
                $($code => Some($msg),)+
                _ => None,
            }
        }
    };
}

well_known! {
    BAD_REQUEST = 400, "bad request";
    UNAUTHORIZED = 401, "unauthorized";
    FORBIDDEN = 403, "forbidden";
    NOT_FOUND = 404, "not found";
    REQUEST_TIMEOUT = 408, "request timeout";
    CONFLICT = 409, "conflict";
    TOO_MANY_REQUESTS = 429, "too many requests";
    /// The caller cancelled the call before it completed.
    CANCELED = 499, "client canceled";
    INTERNAL_SERVER_ERROR = 500, "internal server error";
    UNIMPLEMENTED = 501, "not implemented";
    UNAVAILABLE = 503, "service unavailable";
    /// The call deadline fired.
    TIMEOUT = 504, "gateway timeout";
}

impl OrbError {
    /// Creates an error with an explicit message.
    #[must_use]
    pub fn new(code: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            wrapped: None,
        }
    }

    /// Creates an error from a bare HTTP status code, using the lower-cased
    /// reason phrase as message.
    #[must_use]
    pub fn http(code: u16) -> Self {
        if let Some(msg) = default_message(code) {
            return Self::new(code, msg);
        }
        let message = StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map_or_else(|| Cow::Borrowed("unknown error"), |r| Cow::Owned(r.to_lowercase()));
        Self::new(code, message)
    }

    /// Maps a DRPC numeric error code. Codes inside the HTTP range are used
    /// verbatim, everything else becomes 500.
    #[must_use]
    pub fn from_drpc_code(code: u64, message: &str) -> Self {
        let http = u16::try_from(code)
            .ok()
            .filter(|c| (100..=599).contains(c))
            .unwrap_or(500);
        if message.is_empty() {
            Self::http(http)
        } else {
            Self::new(http, message.to_owned())
        }
    }

    /// Attaches `cause`, keeping the code and message.
    ///
    /// An already present cause is kept behind the new one.
    #[must_use]
    pub fn wrap<E>(mut self, cause: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let cause: Cause = Arc::from(cause.into());
        self.wrapped = Some(match self.wrapped.take() {
            Some(inner) => Arc::new(Chain { outer: cause, inner }),
            None => cause,
        });
        self
    }

    /// Coerces any error into the taxonomy.
    ///
    /// An `OrbError` anywhere in the source chain is returned as-is, anything
    /// else becomes a 500 wrapping the original.
    #[must_use]
    pub fn from_error<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let boxed = err.into();
        if let Some(found) = Self::find(boxed.as_ref()) {
            return found.clone();
        }
        Self::INTERNAL_SERVER_ERROR.wrap(boxed)
    }

    /// Finds the first `OrbError` in the source chain of `err`.
    #[must_use]
    pub fn find<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a OrbError> {
        let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = cur {
            if let Some(orb) = e.downcast_ref::<OrbError>() {
                return Some(orb);
            }
            cur = e.source();
        }
        None
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The wrapped cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.wrapped.as_deref()
    }

    /// Two errors are the same kind when their codes match.
    #[must_use]
    pub fn is(&self, other: &OrbError) -> bool {
        self.code == other.code
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.code == Self::CANCELED.code
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.code == Self::TIMEOUT.code || self.code == Self::REQUEST_TIMEOUT.code
    }

    /// The matching HTTP status, falling back to 500 for codes outside the
    /// representable range.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for OrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.wrapped {
            Some(cause) => write!(f, "{}: {cause}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl fmt::Debug for OrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrbError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("wrapped", &self.wrapped.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl StdError for OrbError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.wrapped
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<StatusCode> for OrbError {
    fn from(status: StatusCode) -> Self {
        Self::http(status.as_u16())
    }
}

impl From<std::io::Error> for OrbError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let base = match err.kind() {
            ErrorKind::TimedOut => Self::TIMEOUT,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => Self::UNAVAILABLE,
            _ => Self::INTERNAL_SERVER_ERROR,
        };
        base.wrap(err)
    }
}

#[derive(Debug)]
struct Chain {
    outer: Cause,
    inner: Cause,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.outer, self.inner)
    }
}

impl StdError for Chain {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}
