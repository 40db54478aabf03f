// Typed lifecycle for a live session. Client events become explicit
// transitions so the shutting-down guard and restart decisions live in
// one place instead of inside every event handler.

/// Where a session sits in its lifecycle. Serialized lowercase into the
/// agents table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initialising,
    AwaitingQr,
    Connected,
    Disconnected,
    AuthFailed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialising => "initialising",
            Self::AwaitingQr => "awaiting_qr",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthFailed => "auth_failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "initialising" => Self::Initialising,
            "awaiting_qr" => Self::AwaitingQr,
            "connected" => Self::Connected,
            "auth_failed" => Self::AuthFailed,
            _ => Self::Disconnected,
        }
    }
}

/// Lifecycle inputs from the client event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    QrIssued,
    Ready,
    AuthFailure,
    Disconnected { mentions_logout: bool },
}

/// What the supervisor must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Cache the QR, resolve the waiter, persist `awaiting_qr`.
    PublishQr,
    /// Mark ready, count the session once, persist `connected`.
    Activate,
    /// Persist the failure status and schedule a restart.
    Fail {
        status: SessionStatus,
        clear_auth: bool,
    },
    /// Session is shutting down; the event must not mutate state.
    Ignore,
}

pub fn step(shutting_down: bool, event: LifecycleEvent) -> Step {
    if shutting_down {
        return Step::Ignore;
    }
    match event {
        LifecycleEvent::QrIssued => Step::PublishQr,
        LifecycleEvent::Ready => Step::Activate,
        LifecycleEvent::AuthFailure => Step::Fail {
            status: SessionStatus::AuthFailed,
            clear_auth: true,
        },
        LifecycleEvent::Disconnected { mentions_logout } => Step::Fail {
            status: SessionStatus::Disconnected,
            clear_auth: mentions_logout,
        },
    }
}

/// Disconnect reasons that invalidate the stored credentials.
pub fn mentions_logout(reason: &str) -> bool {
    let normalized = reason.to_lowercase();
    normalized.contains("logout") || normalized.contains("logged out")
}

/// First restart delay for the n-th attempt.
pub fn restart_delay(attempt: u32) -> std::time::Duration {
    let seconds = (u64::from(attempt) * 5).min(30);
    std::time::Duration::from_secs(seconds)
}

/// Backed-off delay when a restart attempt itself failed.
pub fn retry_delay(previous: std::time::Duration) -> std::time::Duration {
    (previous * 2).min(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Initialising,
            SessionStatus::AwaitingQr,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::AuthFailed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), status);
        }
        assert_eq!(SessionStatus::parse("garbage"), SessionStatus::Disconnected);
    }

    #[test]
    fn shutting_down_suppresses_every_transition() {
        for event in [
            LifecycleEvent::QrIssued,
            LifecycleEvent::Ready,
            LifecycleEvent::AuthFailure,
            LifecycleEvent::Disconnected {
                mentions_logout: true,
            },
        ] {
            assert_eq!(step(true, event), Step::Ignore);
        }
    }

    #[test]
    fn auth_failure_always_clears_auth() {
        assert_eq!(
            step(false, LifecycleEvent::AuthFailure),
            Step::Fail {
                status: SessionStatus::AuthFailed,
                clear_auth: true,
            }
        );
    }

    #[test]
    fn disconnect_clears_auth_only_on_logout() {
        assert_eq!(
            step(
                false,
                LifecycleEvent::Disconnected {
                    mentions_logout: false,
                }
            ),
            Step::Fail {
                status: SessionStatus::Disconnected,
                clear_auth: false,
            }
        );
        assert_eq!(
            step(
                false,
                LifecycleEvent::Disconnected {
                    mentions_logout: true,
                }
            ),
            Step::Fail {
                status: SessionStatus::Disconnected,
                clear_auth: true,
            }
        );
    }

    #[test]
    fn logout_detection_is_case_insensitive() {
        assert!(mentions_logout("LOGOUT"));
        assert!(mentions_logout("user Logout requested"));
        assert!(mentions_logout("Logged out"));
        assert!(!mentions_logout("NAVIGATION"));
        assert!(!mentions_logout("connection reset"));
    }

    #[test]
    fn restart_delays_grow_and_cap() {
        assert_eq!(restart_delay(1), Duration::from_secs(5));
        assert_eq!(restart_delay(3), Duration::from_secs(15));
        assert_eq!(restart_delay(6), Duration::from_secs(30));
        assert_eq!(restart_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn retry_delays_double_and_cap() {
        assert_eq!(retry_delay(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(
            retry_delay(Duration::from_secs(40)),
            Duration::from_secs(60)
        );
    }
}
