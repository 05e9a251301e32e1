use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Таймер с номером поколения.
///
/// `cancel` прерывает задачу и меняет поколение, так что уже стоящие в
/// очереди сообщения старого таймера распознаются и отбрасываются.
#[derive(Debug, Default)]
pub struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    /// Периодический вызов `fire(generation)`; первый через `period`.
    /// Возвращаемое `false` останавливает таймер.
    pub fn start_interval<F>(&mut self, period: Duration, fire: F)
    where
        F: Fn(u64) -> bool + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !fire(generation) {
                    break;
                }
            }
        }));
    }

    /// Однократный вызов через `delay`
    pub fn start_once<F, Fut>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation).await;
        }));
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_after_first_period() {
        let count = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&count);
        let mut timer = Timer::default();
        timer.start_interval(Duration::from_secs(1), move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_and_bumps_generation() {
        let count = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&count);
        let mut timer = Timer::default();
        timer.start_once(Duration::from_secs(1), move |_| async move {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        let generation = timer.generation();
        assert!(timer.is_current(generation));

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!timer.is_current(generation));
        assert!(timer.handle.is_none());
    }
}
