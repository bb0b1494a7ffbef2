//! Memory budget tracking for resident page data
//!
//! Tracks bytes of device memory held by resident pages and decides when the
//! paging system has to evict. A total budget of zero means unlimited.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory pressure level indicating residency health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-100% utilization)
    High,
    /// Memory usage exceeds the budget
    OverBudget,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization <= 1.0 {
            MemoryPressure::High
        } else {
            MemoryPressure::OverBudget
        }
    }

    /// Returns true if resident pages must be evicted
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::OverBudget)
    }
}

/// Configuration for the memory budget
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudgetConfig {
    /// Total budget in bytes; 0 disables the limit
    pub total_budget: usize,
    /// Target utilization after eviction (0.0 to 1.0)
    pub target_utilization: f64,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            total_budget: 2 * 1024 * 1024 * 1024,
            target_utilization: 0.9,
        }
    }
}

impl MemoryBudgetConfig {
    /// Create a configuration with a total budget in bytes
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            ..Default::default()
        }
    }

    /// Set the target utilization after eviction (0.0 to 1.0)
    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target.clamp(0.0, 1.0);
        self
    }
}

/// Memory budget tracker.
///
/// Usage and the limit are atomics so the budget can be read from fill
/// workers without taking the paging lock.
///
/// # Example
///
/// ```
/// use demand_loading_memory::{MemoryBudget, MemoryBudgetConfig};
///
/// let budget = MemoryBudget::new(MemoryBudgetConfig::new(1000).with_target_utilization(0.8));
/// budget.record_allocation(1200);
/// assert!(budget.is_over_budget());
/// assert_eq!(budget.bytes_to_evict(), 400);
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    total_budget: AtomicUsize,
    target_utilization: f64,
    current_usage: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self {
            total_budget: AtomicUsize::new(config.total_budget),
            target_utilization: config.target_utilization,
            current_usage: AtomicUsize::new(0),
        }
    }

    /// Create a budget with a total limit in bytes
    pub fn with_limit(total_bytes: usize) -> Self {
        Self::new(MemoryBudgetConfig::new(total_bytes))
    }

    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget.load(Ordering::Relaxed)
    }

    pub fn is_unlimited(&self) -> bool {
        self.total_budget() == 0
    }

    /// Get the available memory in bytes (`usize::MAX` when unlimited)
    pub fn available(&self) -> usize {
        if self.is_unlimited() {
            usize::MAX
        } else {
            self.total_budget().saturating_sub(self.current_usage())
        }
    }

    /// Get the current utilization ratio; may exceed 1.0
    pub fn utilization(&self) -> f64 {
        let total = self.total_budget();
        if total == 0 {
            0.0
        } else {
            self.current_usage() as f64 / total as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// Check if the given allocation can fit within the budget
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.is_unlimited() || self.current_usage().saturating_add(bytes) <= self.total_budget()
    }

    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Returns true when resident bytes exceed the budget
    pub fn is_over_budget(&self) -> bool {
        !self.is_unlimited() && self.current_usage() > self.total_budget()
    }

    /// Get the target bytes after eviction
    pub fn target_bytes(&self) -> usize {
        (self.total_budget() as f64 * self.target_utilization) as usize
    }

    /// Calculate how many bytes need to be evicted to reach the target.
    ///
    /// Returns 0 while usage is within budget.
    pub fn bytes_to_evict(&self) -> usize {
        if !self.is_over_budget() {
            return 0;
        }
        self.current_usage().saturating_sub(self.target_bytes())
    }

    /// Update the total budget
    pub fn set_total_budget(&self, bytes: usize) {
        self.total_budget.store(bytes, Ordering::Relaxed);
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(MemoryBudgetConfig::default())
    }
}
