//! Peer-session state and connection-quality classification.

/// Which side initiated negotiation for a peer session. Fixed at
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// Negotiation state of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    /// Local offer sent, waiting for the remote answer.
    Offering,
    /// Remote offer received, local answer being produced.
    AnswerPending,
    /// Descriptions exchanged, transport negotiation in progress.
    Negotiating,
    Established,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }

    /// States with an outstanding negotiation that can time out.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            PeerState::Offering | PeerState::AnswerPending | PeerState::Negotiating
        )
    }
}

/// Last-observed quality classification of one negotiated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Aggregated quality across every live peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomQuality {
    /// No peers to rate.
    Empty,
    Excellent,
    Good,
    Fair,
    Poor,
}

impl RoomQuality {
    /// Fold per-link classifications into a room-wide rating.
    pub fn aggregate(links: &[LinkQuality]) -> RoomQuality {
        if links.is_empty() {
            return RoomQuality::Empty;
        }

        let total = links.len();
        let count = |q: LinkQuality| links.iter().filter(|l| **l == q).count();
        let excellent = count(LinkQuality::Excellent);
        let good = count(LinkQuality::Good);
        let fair = count(LinkQuality::Fair);
        let poor = count(LinkQuality::Poor);

        if excellent == total {
            RoomQuality::Excellent
        } else if good > 0 && poor == 0 {
            RoomQuality::Good
        } else if fair > 0 || poor * 2 < total {
            RoomQuality::Fair
        } else {
            RoomQuality::Poor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LinkQuality::*;

    #[test]
    fn no_links_is_empty() {
        assert_eq!(RoomQuality::aggregate(&[]), RoomQuality::Empty);
    }

    #[test]
    fn all_excellent() {
        assert_eq!(
            RoomQuality::aggregate(&[Excellent, Excellent]),
            RoomQuality::Excellent
        );
    }

    #[test]
    fn handshaking_links_rate_good() {
        assert_eq!(
            RoomQuality::aggregate(&[Excellent, Good]),
            RoomQuality::Good
        );
    }

    #[test]
    fn degraded_links_rate_fair() {
        assert_eq!(
            RoomQuality::aggregate(&[Excellent, Fair]),
            RoomQuality::Fair
        );
        // one poor link out of three stays fair
        assert_eq!(
            RoomQuality::aggregate(&[Excellent, Excellent, Poor]),
            RoomQuality::Fair
        );
    }

    #[test]
    fn mostly_poor_rates_poor() {
        assert_eq!(RoomQuality::aggregate(&[Poor]), RoomQuality::Poor);
        assert_eq!(
            RoomQuality::aggregate(&[Excellent, Poor]),
            RoomQuality::Poor
        );
    }

    #[test]
    fn terminal_states() {
        assert!(PeerState::Closed.is_terminal());
        assert!(PeerState::Failed.is_terminal());
        assert!(!PeerState::Established.is_terminal());
        assert!(PeerState::Offering.is_negotiating());
        assert!(!PeerState::Established.is_negotiating());
    }
}
