use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub text: String,
    pub created_at: Instant,
}

/// Ephemeral proctoring alerts. Each one is visible for a fixed window
/// starting at its creation and is gone afterwards.
#[derive(Debug)]
pub struct AlertBoard {
    ttl: Duration,
    alerts: Vec<Alert>,
}

impl AlertBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            alerts: Vec::new(),
        }
    }

    pub fn push(&mut self, text: impl Into<String>, now: Instant) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            text: text.into(),
            created_at: now,
        };
        self.alerts.push(alert.clone());
        alert
    }

    pub fn is_active(&self, alert: &Alert, now: Instant) -> bool {
        now >= alert.created_at && now < alert.created_at + self.ttl
    }

    pub fn active(&self, now: Instant) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| self.is_active(a, now))
            .cloned()
            .collect()
    }

    /// Drop expired alerts, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.alerts.len();
        let ttl = self.ttl;
        self.alerts.retain(|a| now < a.created_at + ttl);
        before - self.alerts.len()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_window() {
        let ttl = Duration::from_millis(5000);
        let mut board = AlertBoard::new(ttl);
        let t = Instant::now();
        let alert = board.push("Candidate switched away", t);

        assert_eq!(board.active(t), vec![alert.clone()]);
        assert_eq!(board.active(t + Duration::from_millis(4999)).len(), 1);
        assert!(board.active(t + ttl).is_empty());
        assert!(board.active(t + Duration::from_millis(9000)).is_empty());

        assert_eq!(board.prune(t + Duration::from_millis(4000)), 0);
        assert_eq!(board.prune(t + ttl), 1);
        assert!(board.is_empty());
    }

    #[test]
    fn test_alerts_expire_independently() {
        let mut board = AlertBoard::new(Duration::from_secs(5));
        let t = Instant::now();
        board.push("first", t);
        board.push("second", t + Duration::from_secs(3));
        let at = t + Duration::from_secs(6);
        let active = board.active(at);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].text, "second");
        board.prune(at);
        assert_eq!(board.len(), 1);
    }
}
