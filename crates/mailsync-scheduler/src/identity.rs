//! Identity of this sync process within the fleet.

use std::fmt;

/// Stable identity of one sync process.
///
/// The process identifier is the value written to the assignment service and
/// to an account's `sync_host`; host and cpu id are labels for logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    host: String,
    cpu_id: u32,
    process_identifier: String,
}

impl ProcessIdentity {
    /// Creates an identity, resolving the local host name.
    pub fn new(process_identifier: impl Into<String>, cpu_id: u32) -> Self {
        Self::with_host(local_hostname(), cpu_id, process_identifier)
    }

    /// Creates an identity with an explicit host name.
    pub fn with_host(
        host: impl Into<String>,
        cpu_id: u32,
        process_identifier: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            cpu_id,
            process_identifier: process_identifier.into(),
        }
    }

    /// Identity using the default `<host>:<cpu_id>` process identifier.
    #[must_use]
    pub fn for_cpu(cpu_id: u32) -> Self {
        let host = local_hostname();
        let process_identifier = format!("{host}:{cpu_id}");
        Self::with_host(host, cpu_id, process_identifier)
    }

    /// Host name this process runs on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Core index label.
    #[must_use]
    pub const fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    /// Fleet-unique identifier of this process.
    #[must_use]
    pub fn process_identifier(&self) -> &str {
        &self.process_identifier
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.process_identifier)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}
