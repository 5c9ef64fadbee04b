//! Kernel configuration
use crate::{error::InitError, utils::prio_bitmap_words};

/// The number of task priority levels. Priority `0` is the most urgent one.
pub const NUM_TASK_PRIORITY_LEVELS: usize = 32;

/// The priority of the idle task, which is the least urgent priority.
pub const IDLE_PRIORITY: usize = NUM_TASK_PRIORITY_LEVELS - 1;

/// The number of words in the ready bitmap.
pub(crate) const READY_BITMAP_WORDS: usize = prio_bitmap_words(NUM_TASK_PRIORITY_LEVELS);

/// The value planted at the lowest word of every task stack. A task whose
/// stack no longer holds this value at a context save has overflowed it.
pub const STACK_MAGIC: usize = 0x5a5a_a5a5;

/// The smallest stack size (in bytes) accepted for a task.
pub const MIN_STACK_SIZE: usize = 256;

/// The exit code reported to joiners of a task that was killed.
pub const EXIT_CODE_KILLED: i32 = i32::MIN;

/// Kernel parameters fixed at construction time.
///
/// Stack sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCfg {
    /// Tasks created with a priority more urgent than this value are demoted
    /// to their creator's priority. Priorities below this value are reserved
    /// for system tasks.
    pub reserved_priority: usize,
    /// The priority of the task running the application's initialization
    /// routine.
    pub init_priority: usize,
    pub init_stack_size: usize,
    pub idle_stack_size: usize,
    /// The priority of the software timer daemon.
    pub timer_daemon_priority: usize,
    pub timer_daemon_stack_size: usize,
    /// The high-priority system workqueue. This queue also reclaims exited
    /// tasks.
    pub high_workqueue_priority: usize,
    pub high_workqueue_stack_size: usize,
    /// The number of ring slots of the high-priority system workqueue. Must be
    /// a power of two.
    pub high_workqueue_capacity: usize,
    pub low_workqueue_priority: usize,
    pub low_workqueue_stack_size: usize,
    pub low_workqueue_capacity: usize,
    /// The length of the CPU utilization sampling window, measured in ticks.
    pub cpu_rate_interval_ticks: u32,
}

impl KernelCfg {
    pub const DEFAULT: Self = Self {
        reserved_priority: 3,
        init_priority: 3,
        init_stack_size: 4096,
        idle_stack_size: 1024,
        timer_daemon_priority: 1,
        timer_daemon_stack_size: 2048,
        high_workqueue_priority: 0,
        high_workqueue_stack_size: 2048,
        high_workqueue_capacity: 16,
        low_workqueue_priority: IDLE_PRIORITY - 1,
        low_workqueue_stack_size: 2048,
        low_workqueue_capacity: 16,
        cpu_rate_interval_ticks: 1000,
    };

    /// Check the consistency of the configuration.
    pub fn validate(&self) -> Result<(), InitError> {
        let system_priorities = [
            self.timer_daemon_priority,
            self.high_workqueue_priority,
            self.low_workqueue_priority,
            self.init_priority,
        ];
        let stack_sizes = [
            self.init_stack_size,
            self.idle_stack_size,
            self.timer_daemon_stack_size,
            self.high_workqueue_stack_size,
            self.low_workqueue_stack_size,
        ];

        if self.reserved_priority >= IDLE_PRIORITY
            || system_priorities.iter().any(|&p| p >= IDLE_PRIORITY)
            || stack_sizes.iter().any(|&s| s < MIN_STACK_SIZE)
            || !is_valid_ring_capacity(self.high_workqueue_capacity)
            || !is_valid_ring_capacity(self.low_workqueue_capacity)
            || self.cpu_rate_interval_ticks == 0
        {
            return Err(InitError::BadParam);
        }

        Ok(())
    }
}

impl Default for KernelCfg {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A workqueue ring needs a power-of-two capacity with room for at least one
/// entry besides the slot that is always kept free.
pub(crate) const fn is_valid_ring_capacity(capacity: usize) -> bool {
    capacity >= 2 && capacity.is_power_of_two()
}
