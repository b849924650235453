use tokio::sync::broadcast;

/// Subscribers is a publish/subscribe hub: the coordinator pushes events
/// without knowing who, if anyone, listens
#[derive(Debug)]
pub struct Subscribers<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// push returns how many subscribers received the value; having none
    /// is not an error
    pub fn push(&self, value: T) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_the_push() {
        let hub = Subscribers::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.push(7u8), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[test]
    fn push_without_subscribers_is_dropped() {
        let hub: Subscribers<u8> = Subscribers::new(4);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.push(1), 0);
    }
}
