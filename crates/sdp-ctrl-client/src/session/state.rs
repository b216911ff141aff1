//! Session states.

use std::fmt;

use crate::error::RequestCategory;

/// Where the session stands in its request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Connected, nothing outstanding.
    #[default]
    Ready,
    KeepAliveRequesting,
    KeepAliveUnfulfilled,
    CredRequesting,
    CredUnfulfilled,
    /// Requests escalated to terminal failure; the run loop must exit.
    TimeToQuit,
}

impl SessionState {
    /// The category this state is tracking, if any.
    pub const fn category(self) -> Option<RequestCategory> {
        match self {
            Self::KeepAliveRequesting | Self::KeepAliveUnfulfilled => {
                Some(RequestCategory::KeepAlive)
            }
            Self::CredRequesting | Self::CredUnfulfilled => Some(RequestCategory::Credential),
            Self::Ready | Self::TimeToQuit => None,
        }
    }

    /// Whether a request of `category` may be issued from this state.
    pub fn accepts(self, category: RequestCategory) -> bool {
        self == Self::Ready || self.category() == Some(category)
    }

    pub fn is_tracking(self, category: RequestCategory) -> bool {
        self.category() == Some(category)
    }

    pub const fn requesting(category: RequestCategory) -> Self {
        match category {
            RequestCategory::KeepAlive => Self::KeepAliveRequesting,
            RequestCategory::Credential => Self::CredRequesting,
        }
    }

    pub const fn unfulfilled(category: RequestCategory) -> Self {
        match category {
            RequestCategory::KeepAlive => Self::KeepAliveUnfulfilled,
            RequestCategory::Credential => Self::CredUnfulfilled,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::KeepAliveRequesting => "KEEP_ALIVE_REQUESTING",
            Self::KeepAliveUnfulfilled => "KEEP_ALIVE_UNFULFILLED",
            Self::CredRequesting => "CRED_REQUESTING",
            Self::CredUnfulfilled => "CRED_UNFULFILLED",
            Self::TimeToQuit => "TIME_TO_QUIT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_accepts_both_categories() {
        assert!(SessionState::Ready.accepts(RequestCategory::KeepAlive));
        assert!(SessionState::Ready.accepts(RequestCategory::Credential));
    }

    #[test]
    fn pending_category_blocks_the_other() {
        for state in [SessionState::CredRequesting, SessionState::CredUnfulfilled] {
            assert!(state.accepts(RequestCategory::Credential));
            assert!(!state.accepts(RequestCategory::KeepAlive));
        }
        for state in [
            SessionState::KeepAliveRequesting,
            SessionState::KeepAliveUnfulfilled,
        ] {
            assert!(state.accepts(RequestCategory::KeepAlive));
            assert!(!state.accepts(RequestCategory::Credential));
        }
    }

    #[test]
    fn time_to_quit_accepts_nothing() {
        assert!(!SessionState::TimeToQuit.accepts(RequestCategory::KeepAlive));
        assert!(!SessionState::TimeToQuit.accepts(RequestCategory::Credential));
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(SessionState::CredUnfulfilled.to_string(), "CRED_UNFULFILLED");
        assert_eq!(SessionState::default().to_string(), "READY");
    }
}
