//! Ping bookkeeping for one connection.
//!
//! Every interval tick either sends a ping or, if the previous ping is still
//! unanswered, counts a miss.  Reaching `max_missed` misses expires the
//! connection.  Any pong clears the count.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ping,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    max_missed: u32,
    missed: u32,
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            missed: 0,
            awaiting_pong: false,
        }
    }

    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.awaiting_pong {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return HeartbeatAction::Expired;
            }
        }
        self.awaiting_pong = true;
        HeartbeatAction::Ping
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answered_pings_never_expire() {
        let mut hb = Heartbeat::new(2);
        for _ in 0..10 {
            assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
            hb.on_pong();
        }
        assert_eq!(hb.missed(), 0);
    }

    #[test]
    fn expires_after_max_unanswered() {
        let mut hb = Heartbeat::new(2);
        assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
        assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
        assert_eq!(hb.missed(), 1);
        assert_eq!(hb.on_tick(), HeartbeatAction::Expired);
    }

    #[test]
    fn late_pong_resets_the_count() {
        let mut hb = Heartbeat::new(2);
        hb.on_tick();
        hb.on_tick();
        hb.on_pong();
        assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
        assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
        assert_eq!(hb.on_tick(), HeartbeatAction::Expired);
    }

    #[test]
    fn zero_threshold_behaves_as_one() {
        let mut hb = Heartbeat::new(0);
        assert_eq!(hb.on_tick(), HeartbeatAction::Ping);
        assert_eq!(hb.on_tick(), HeartbeatAction::Expired);
    }
}
