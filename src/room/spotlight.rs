#![forbid(unsafe_code)]

// Spotlight selection

use super::peer::PeerId;

/// Picks the bounded set of always-visible peers.
pub trait SpotlightPolicy: Send + Sync {
    /// `joined` is in join order, `speakers` most recent speaker first.
    /// Every returned id must come from `joined`.
    fn select(&self, joined: &[&str], speakers: &[PeerId], limit: usize) -> Vec<PeerId>;
}

/// Most recent speakers first, remaining slots filled in join order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecentSpeakers;

impl SpotlightPolicy for RecentSpeakers {
    fn select(&self, joined: &[&str], speakers: &[PeerId], limit: usize) -> Vec<PeerId> {
        let mut selected: Vec<PeerId> = Vec::with_capacity(limit);

        let by_recency = speakers.iter().map(String::as_str).filter(|id| joined.contains(id));
        for id in by_recency.chain(joined.iter().copied()) {
            if selected.len() == limit {
                break;
            }
            if !selected.iter().any(|s| s == id) {
                selected.push(id.to_string());
            }
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<PeerId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_order_when_nobody_spoke() {
        let picked = RecentSpeakers.select(&["a", "b", "c"], &[], 2);
        assert_eq!(picked, ids(&["a", "b"]));
    }

    #[test]
    fn test_recent_speakers_first() {
        let picked = RecentSpeakers.select(&["a", "b", "c", "d"], &ids(&["d", "b"]), 3);
        assert_eq!(picked, ids(&["d", "b", "a"]));
    }

    #[test]
    fn test_departed_speakers_ignored() {
        let picked = RecentSpeakers.select(&["a", "b"], &ids(&["gone", "b"]), 5);
        assert_eq!(picked, ids(&["b", "a"]));
    }

    #[test]
    fn test_zero_limit() {
        assert!(RecentSpeakers.select(&["a"], &ids(&["a"]), 0).is_empty());
    }
}
