//! IdGenerator port - タスクと dead letter の ID 採番
//!
//! UlidGenerator は timestamp 部分を Clock から取る。FixedClock と組み合わせると
//! テストで created_at と ID の時刻がそろう。

use ulid::Ulid;

use crate::domain::{DeadLetterId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_dead_letter_id(&self) -> DeadLetterId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        // pre-epoch clocks collapse to 0
        let millis = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(millis, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next())
    }

    fn generate_dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId::from_ulid(self.next())
    }
}
