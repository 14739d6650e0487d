use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{ChannelKey, Notification};

const CHANNEL_CAPACITY: usize = 256;

/// Per doctor+date fan-out of lock and capacity events.
///
/// `send` is synchronous and never blocks, so callers may publish while
/// holding a slot's critical section; that is what keeps per-key event order.
pub struct NotifyHub {
    channels: DashMap<ChannelKey, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: ChannelKey) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish. No-op if nobody ever subscribed.
    pub fn send(&self, channel: &ChannelKey, notification: Notification) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(notification);
        }
    }

    /// Drop the channel once its last receiver is gone.
    pub fn remove_if_idle(&self, channel: &ChannelKey) {
        self.channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn channel() -> ChannelKey {
        ChannelKey::new(Ulid::new(), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let ch = channel();
        let mut rx = hub.subscribe(ch);

        let event = Notification::ScheduleChanged {
            schedule_id: Ulid::new(),
            is_active: true,
        };
        hub.send(&ch, event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = NotifyHub::new();
        let a = channel();
        let b = channel();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(
            &b,
            Notification::ScheduleChanged {
                schedule_id: Ulid::new(),
                is_active: false,
            },
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            &channel(),
            Notification::ScheduleChanged {
                schedule_id: Ulid::new(),
                is_active: true,
            },
        );
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn idle_channel_is_removed() {
        let hub = NotifyHub::new();
        let ch = channel();
        let rx = hub.subscribe(ch);
        hub.remove_if_idle(&ch);
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.remove_if_idle(&ch);
        assert_eq!(hub.channel_count(), 0);
    }
}
