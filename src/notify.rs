//! Fire-and-forget notification sink. Every user-visible outcome from the
//! import and broadcast subsystems goes through here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

pub trait Notify: Send + Sync {
    fn notify(&self, title: &str, description: &str, severity: Severity);
}

/// Production sink: structured log lines.
pub struct TracingNotifier;

impl Notify for TracingNotifier {
    fn notify(&self, title: &str, description: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(title, "{description}"),
            Severity::Error => tracing::error!(title, "{description}"),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures notifications for assertions.
    #[derive(Default)]
    pub struct CapturingNotifier {
        pub messages: Mutex<Vec<(String, String, Severity)>>,
    }

    impl Notify for CapturingNotifier {
        fn notify(&self, title: &str, description: &str, severity: Severity) {
            self.messages.lock().unwrap().push((
                title.to_string(),
                description.to_string(),
                severity,
            ));
        }
    }
}
