use crate::peer::types::IceCandidate;

/// Флаги perfect negotiation для одного peer connection.
///
/// Сбрасываются при пересоздании соединения; `polite` задаётся один раз.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiationFlags {
    pub polite: bool,
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub is_setting_remote_answer_pending: bool,
}

/// Частичное обновление флагов; `None` оставляет поле как есть
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagsUpdate {
    pub making_offer: Option<bool>,
    pub ignore_offer: Option<bool>,
    pub is_setting_remote_answer_pending: Option<bool>,
}

impl NegotiationFlags {
    pub fn new(polite: bool) -> Self {
        Self {
            polite,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, update: FlagsUpdate) {
        if let Some(v) = update.making_offer {
            self.making_offer = v;
        }
        if let Some(v) = update.ignore_offer {
            self.ignore_offer = v;
        }
        if let Some(v) = update.is_setting_remote_answer_pending {
            self.is_setting_remote_answer_pending = v;
        }
    }

    /// Всё в false, кроме роли
    pub fn reset(&mut self) {
        *self = Self::new(self.polite);
    }
}

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push(candidate);
    }

    pub fn take(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.queue)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
