/// Outcome of comparing the serial the device reports with the configured one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnCheck {
    /// Serials agree; log in.
    Match,
    /// Nothing configured; adopt the device's serial and log in.
    Adopt(String),
    /// Serials differ; hold the login until the caller decides.
    Conflict { remote: String, configured: String },
}

pub fn reconcile_sn(configured: Option<&str>, remote: &str) -> SnCheck {
    match configured.filter(|sn| !sn.is_empty()) {
        None => SnCheck::Adopt(remote.to_string()),
        Some(sn) if sn == remote => SnCheck::Match,
        Some(sn) => SnCheck::Conflict {
            remote: remote.to_string(),
            configured: sn.to_string(),
        },
    }
}
