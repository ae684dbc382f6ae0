//! Core types shared across target introspection: source locations, function
//! identity, call entries, and the error kinds introspection can fail with.

use std::fmt;

pub use nix::unistd::Pid;

/// A location inside the target's script source, as recorded by a Zeek
/// `Location` object. Absent is `("", 0, 0)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SourceLocation {
    pub filename: String,
    pub first_line: i64,
    pub last_line: i64,
}

/// What kind of target function a `FunctionDescriptor` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Script,
    Builtin,
}

/// A function as observed in the target, identified by `(filename, name,
/// first_line)` for interning purposes — the address is informational only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionDescriptor {
    pub address: u64,
    pub name: String,
    pub kind: FunctionKind,
    pub location: SourceLocation,
}

/// A single stack frame as reconstructed from the target's call-info vector.
/// The call-site fields, when present, refine the function's own home
/// location with where the caller actually invoked it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallEntry {
    pub function: FunctionDescriptor,
    pub call_site_filename: String,
    pub call_site_line: i64,
}

impl CallEntry {
    /// The `(filename, line)` pair the accumulator should attribute this
    /// frame to: the call site if known, else the function's own home.
    pub fn attribution(&self) -> (&str, i64) {
        if !self.call_site_filename.is_empty() {
            (&self.call_site_filename, self.call_site_line)
        } else {
            (&self.function.location.filename, self.function.location.first_line)
        }
    }
}

impl fmt::Display for CallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (filename, line) = self.attribution();
        write!(f, "{} - {}:{}", self.function.name, filename, line)
    }
}

pub fn empty_call_stack_entry() -> CallEntry {
    CallEntry {
        function: FunctionDescriptor {
            address: 0,
            name: "<empty_call_stack>".to_string(),
            kind: FunctionKind::Builtin,
            location: SourceLocation {
                filename: "<zeek>".to_string(),
                first_line: 0,
                last_line: 0,
            },
        },
        call_site_filename: "<zeek>".to_string(),
        call_site_line: 0,
    }
}

/// Errors from attaching to, reading, or resolving the target process.
/// `main` and the sampling loop wrap these with `anyhow::Context`; any one
/// of them during a sample stops the loop without a retry.
#[derive(thiserror::Error, Debug)]
pub enum IntrospectionError {
    #[error("failed to attach to pid {0}: {1}")]
    AttachFailed(libc::pid_t, #[source] nix::Error),

    #[error("process {0} exited before it could be traced")]
    TargetExited(libc::pid_t),

    #[error("process {0} reported an unexpected wait status: {1:?}")]
    TargetNotStopped(libc::pid_t, nix::sys::wait::WaitStatus),

    #[error("failed to detach from pid {0}: {1}")]
    DetachFailed(libc::pid_t, #[source] nix::Error),

    #[error("failed to read {n_bytes} bytes at {addr:#x} from pid {pid}: {source}")]
    PeekFailed {
        pid: libc::pid_t,
        addr: u64,
        n_bytes: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("required symbol `{0}` not found in target image")]
    MissingSymbol(&'static str),

    #[error("no layout registered for target version `{0}`")]
    UnknownTargetVersion(String),

    #[error("failed to resolve target image for pid {0}: {1}")]
    ImageResolutionFailed(libc::pid_t, String),
}

#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("failed to create output file {path}: {source}")]
    CreateFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize profile: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("failed to write profile: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribution_prefers_call_site() {
        let mut entry = CallEntry {
            function: FunctionDescriptor {
                address: 0x1000,
                name: "dns_message".to_string(),
                kind: FunctionKind::Builtin,
                location: SourceLocation {
                    filename: "dns.bif".to_string(),
                    first_line: 442,
                    last_line: 450,
                },
            },
            call_site_filename: String::new(),
            call_site_line: 0,
        };
        assert_eq!(entry.attribution(), ("dns.bif", 442));

        entry.call_site_filename = "test/data.zeek".to_string();
        entry.call_site_line = 42;
        assert_eq!(entry.attribution(), ("test/data.zeek", 42));
    }

    #[test]
    fn empty_call_stack_is_builtin_and_named() {
        let entry = empty_call_stack_entry();
        assert_eq!(entry.function.name, "<empty_call_stack>");
        assert_eq!(entry.function.kind, FunctionKind::Builtin);
        assert_eq!(entry.attribution(), ("<zeek>", 0));
    }
}
