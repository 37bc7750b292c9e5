//! Capacity-hinted selection over a fixed pool of model endpoints
//!
//! What this module provides
//! - `ModelLoadBalancer`: scores and reserves models under a capacity budget
//!
//! Exports
//! - Models
//!   - `ModelDescriptor { id, relative_speed, capacity, quality }`
//!   - `Priority::{Speed, Quality, Balanced}`
//! - Utils
//!   - `ModelLease`: RAII slot reservation, released on drop
//!
//! Implementation strategy
//! - Counters live behind one `Mutex`; select and release are short critical
//!   sections, so concurrent callers cannot lose updates
//! - Selection never waits for capacity: with every model saturated it falls
//!   back to the primary model as an UNCOUNTED overload lease (the capacity
//!   numbers are a hint, not an admission-control gate)
//!
//! Testing strategy
//! - Unit tests on ordering per priority and on the fallback path
//! - A proptest driving arbitrary select/release sequences against the
//!   capacity invariants

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Weight of speed vs quality in the balanced score.
const BALANCED_SPEED_WEIGHT: f64 = 0.6;
const BALANCED_QUALITY_WEIGHT: f64 = 0.4;

/// Static description of one model endpoint in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    /// Throughput relative to the pool baseline; higher is faster.
    pub relative_speed: f64,
    /// Concurrent-slot budget for this endpoint.
    pub capacity: u32,
    /// Answer quality in `[0, 1]`.
    pub quality: f64,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, relative_speed: f64, capacity: u32, quality: f64) -> Self {
        Self {
            id: id.into(),
            relative_speed,
            capacity,
            quality,
        }
    }
}

/// What the caller wants optimized when several models have free capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Speed,
    Quality,
    #[default]
    Balanced,
}

struct ModelState {
    desc: ModelDescriptor,
    /// Remaining slots; starts at `desc.capacity` which is also the ceiling.
    free: u32,
}

impl ModelState {
    fn score(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Speed => self.desc.relative_speed,
            Priority::Quality => self.desc.quality,
            Priority::Balanced => {
                self.desc.relative_speed * BALANCED_SPEED_WEIGHT
                    + self.desc.quality * BALANCED_QUALITY_WEIGHT
            }
        }
    }
}

/// Scores and reserves models from a fixed pool.
pub struct ModelLoadBalancer {
    pool: Arc<Mutex<Vec<ModelState>>>,
}

impl ModelLoadBalancer {
    /// Build a balancer over `models`. The first entry is the primary model
    /// used as the overload fallback.
    ///
    /// # Panics
    /// Panics if `models` is empty; a balancer with nothing to hand out is a
    /// configuration bug.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        assert!(!models.is_empty(), "model pool must not be empty");
        let pool = models
            .into_iter()
            .map(|desc| ModelState {
                free: desc.capacity,
                desc,
            })
            .collect();
        Self {
            pool: Arc::new(Mutex::new(pool)),
        }
    }

    /// Reserve a slot on the best available model for `priority`.
    ///
    /// When every model is saturated this degrades to the primary model
    /// instead of rejecting the caller; the returned lease is then uncounted
    /// and releasing it is a no-op.
    pub fn select(&self, priority: Priority) -> ModelLease {
        let mut pool = self.pool.lock().expect("balancer lock");
        // Ties keep pool order, so the primary model wins among equals.
        let mut best: Option<usize> = None;
        for (i, m) in pool.iter().enumerate() {
            if m.free == 0 {
                continue;
            }
            match best {
                Some(j) if pool[j].score(priority).total_cmp(&m.score(priority)).is_ge() => {}
                _ => best = Some(i),
            }
        }
        match best {
            Some(i) => {
                let state = &mut pool[i];
                state.free -= 1;
                debug!(model = %state.desc.id, free = state.free, ?priority, "model selected");
                ModelLease {
                    model_id: state.desc.id.clone(),
                    pool: Some(self.pool.clone()),
                }
            }
            None => {
                let fallback = pool[0].desc.id.clone();
                debug!(model = %fallback, "pool saturated, overload fallback");
                ModelLease {
                    model_id: fallback,
                    pool: None,
                }
            }
        }
    }

    /// Remaining free slots for `model_id`, if it is in the pool.
    pub fn free_capacity(&self, model_id: &str) -> Option<u32> {
        let pool = self.pool.lock().expect("balancer lock");
        pool.iter().find(|m| m.desc.id == model_id).map(|m| m.free)
    }

    fn release(pool: &Mutex<Vec<ModelState>>, model_id: &str) {
        let mut pool = pool.lock().expect("balancer lock");
        if let Some(state) = pool.iter_mut().find(|m| m.desc.id == model_id) {
            // Never above the configured ceiling, no matter how callers pair
            // their releases.
            state.free = (state.free + 1).min(state.desc.capacity);
        }
    }
}

impl Default for ModelLoadBalancer {
    /// The production trio: a mid-size default, a lighter fallback, and a
    /// slow high-quality reasoning model.
    fn default() -> Self {
        Self::new(vec![
            ModelDescriptor::new("llama3.2:3b", 1.0, 10, 0.7),
            ModelDescriptor::new("llama3.2:1b", 1.5, 15, 0.5),
            ModelDescriptor::new("deepseek-r1:8b", 0.3, 5, 0.9),
        ])
    }
}

/// A reserved slot on one model. Dropping the lease returns the slot.
#[must_use = "dropping the lease releases the reserved slot immediately"]
pub struct ModelLease {
    model_id: String,
    /// `None` for overload fallback leases, which hold no slot.
    pool: Option<Arc<Mutex<Vec<ModelState>>>>,
}

impl ModelLease {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// True when this lease was handed out past capacity.
    pub fn is_overload(&self) -> bool {
        self.pool.is_none()
    }

    /// Explicit early release; equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            ModelLoadBalancer::release(&pool, &self.model_id);
        }
    }
}
