use crate::error::CallError;
use serde::{Deserialize, Serialize};

/// Лимиты пользователя на сегодня
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub minutes_per_day: u32,
    pub seconds_used_today: u64,
    pub images_per_session: u32,
    pub concurrent_sessions: u32,
}

/// Что добавить к сохранённому расходу по итогам сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    pub seconds: u64,
    pub images: u32,
}

/// Учёт квоты для одной сессии.
///
/// `minutes_per_day == 0` означает ноль минут, а не безлимит.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLedger {
    limits: QuotaLimits,
}

impl QuotaLedger {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    fn allotment_seconds(&self) -> u64 {
        u64::from(self.limits.minutes_per_day) * 60
    }

    /// Остаток на сегодня до начала сессии (может быть отрицательным)
    pub fn allowance_seconds(&self) -> i64 {
        i64::try_from(self.allotment_seconds()).unwrap_or(i64::MAX)
            - i64::try_from(self.limits.seconds_used_today).unwrap_or(i64::MAX)
    }

    /// Остаток с учётом прошедшего времени, не меньше нуля
    pub fn remaining_seconds(&self, elapsed_seconds: u64) -> u64 {
        let elapsed = i64::try_from(elapsed_seconds).unwrap_or(i64::MAX);
        self.allowance_seconds().saturating_sub(elapsed).max(0) as u64
    }

    pub fn check_start(&self) -> Result<(), CallError> {
        if self.remaining_seconds(0) == 0 {
            return Err(CallError::QuotaMinutes);
        }
        if self.limits.concurrent_sessions < 1 {
            return Err(CallError::QuotaSessions);
        }
        Ok(())
    }

    /// Расход сессии; секунды обрезаются так, чтобы не превысить дневной лимит
    pub fn settle(&self, elapsed_seconds: u64, images_sent: u32) -> UsageDelta {
        let room = self
            .allotment_seconds()
            .saturating_sub(self.limits.seconds_used_today);
        UsageDelta {
            seconds: elapsed_seconds.min(room),
            images: images_sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(minutes: u32, used: u64) -> QuotaLimits {
        QuotaLimits {
            minutes_per_day: minutes,
            seconds_used_today: used,
            images_per_session: 2,
            concurrent_sessions: 1,
        }
    }

    #[test]
    fn test_zero_minutes_is_hard_zero() {
        let ledger = QuotaLedger::new(limits(0, 0));
        assert_eq!(ledger.remaining_seconds(0), 0);
        assert_eq!(ledger.check_start(), Err(CallError::QuotaMinutes));
    }

    #[test]
    fn test_last_second_of_the_day() {
        let ledger = QuotaLedger::new(limits(1, 59));
        assert!(ledger.check_start().is_ok());
        assert_eq!(ledger.remaining_seconds(0), 1);
        assert_eq!(ledger.remaining_seconds(1), 0);
        assert_eq!(ledger.remaining_seconds(5), 0);
    }

    #[test]
    fn test_overused_day_blocks_start() {
        let ledger = QuotaLedger::new(limits(1, 75));
        assert_eq!(ledger.allowance_seconds(), -15);
        assert_eq!(ledger.check_start(), Err(CallError::QuotaMinutes));
    }

    #[test]
    fn test_no_concurrent_sessions() {
        let ledger = QuotaLedger::new(QuotaLimits {
            concurrent_sessions: 0,
            ..limits(10, 0)
        });
        assert_eq!(ledger.check_start(), Err(CallError::QuotaSessions));
    }

    #[test]
    fn test_settle_clamps_to_allotment() {
        let ledger = QuotaLedger::new(limits(1, 59));
        assert_eq!(
            ledger.settle(4, 1),
            UsageDelta {
                seconds: 1,
                images: 1
            }
        );
        assert_eq!(QuotaLedger::new(limits(2, 30)).settle(45, 0).seconds, 45);
    }
}
