//! Resource matching interface and a first-fit implementation.

use thiserror::Error;
use tracing::debug;

use crate::task::{Constraint, Resources, TaskDescriptor};
use crate::transport::Offer;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no offer can hold task {0}")]
    NoCapacity(String),

    #[error("no offer satisfies the placement constraints of task {0}")]
    Constrained(String),
}

/// Places tasks onto the offers of one offer round.
///
/// An offer that received at least one task is consumed: it is no longer
/// listed by [`ResourceMatcher::offers`], though it may keep receiving tasks
/// while it has room.
pub trait ResourceMatcher: Send {
    fn add_offers(&mut self, offers: Vec<Offer>);

    /// Returns true while some offer still has room for work.
    fn has_resources(&self) -> bool;

    /// Pick an offer for `task` and reserve the task's resources on it.
    fn assign(&mut self, task: &TaskDescriptor) -> Result<Offer, MatchError>;

    /// Offers that received no task.
    fn offers(&self) -> Vec<Offer>;

    fn clear_offers(&mut self);

    fn add_filter(&mut self, constraint: Constraint);

    fn clear_filters(&mut self);
}

#[derive(Debug)]
struct Slot {
    offer: Offer,
    remaining: Resources,
    used: bool,
}

impl Slot {
    fn satisfies(&self, constraint: &Constraint) -> bool {
        if constraint.attribute == "hostname" {
            return self.offer.hostname == constraint.value;
        }
        self.offer.attributes.get(&constraint.attribute) == Some(&constraint.value)
    }
}

/// Assigns each task to the first offer, in arrival order, that fits it.
#[derive(Debug, Default)]
pub struct FirstFitMatcher {
    slots: Vec<Slot>,
    filters: Vec<Constraint>,
}

impl FirstFitMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceMatcher for FirstFitMatcher {
    fn add_offers(&mut self, offers: Vec<Offer>) {
        self.slots.extend(offers.into_iter().map(|offer| Slot {
            remaining: offer.resources,
            offer,
            used: false,
        }));
    }

    fn has_resources(&self) -> bool {
        self.slots.iter().any(|s| !s.remaining.is_empty())
    }

    fn assign(&mut self, task: &TaskDescriptor) -> Result<Offer, MatchError> {
        let filters = &self.filters;
        let mut constrained = false;

        let slot = self
            .slots
            .iter_mut()
            .filter(|s| {
                let ok = filters.iter().all(|f| s.satisfies(f));
                constrained |= !ok;
                ok
            })
            .find(|s| s.remaining.covers(&task.resources));

        let Some(slot) = slot else {
            return Err(if constrained {
                MatchError::Constrained(task.name.clone())
            } else {
                MatchError::NoCapacity(task.name.clone())
            });
        };

        slot.remaining.consume(&task.resources);
        slot.used = true;
        debug!(
            task = %task.name,
            offer_id = %slot.offer.id,
            agent_id = %slot.offer.agent_id,
            "Task assigned to offer"
        );

        Ok(slot.offer.clone())
    }

    fn offers(&self) -> Vec<Offer> {
        self.slots
            .iter()
            .filter(|s| !s.used)
            .map(|s| s.offer.clone())
            .collect()
    }

    fn clear_offers(&mut self) {
        self.slots.clear();
    }

    fn add_filter(&mut self, constraint: Constraint) {
        self.filters.push(constraint);
    }

    fn clear_filters(&mut self) {
        self.filters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OfferId;

    fn descriptor(name: &str, cpus: f64, mem: f64) -> TaskDescriptor {
        TaskDescriptor::new(name, Resources::new(cpus, mem, 0.0))
    }

    #[test]
    fn test_packs_into_first_fitting_offer() {
        let mut matcher = FirstFitMatcher::new();
        matcher.add_offers(vec![
            Offer::new("o1", "a1", Resources::new(1.0, 256.0, 0.0)),
            Offer::new("o2", "a2", Resources::new(4.0, 4096.0, 0.0)),
        ]);

        let big = matcher.assign(&descriptor("big", 2.0, 1024.0)).unwrap();
        assert_eq!(big.id.as_str(), "o2");

        let small = matcher.assign(&descriptor("small", 1.0, 128.0)).unwrap();
        assert_eq!(small.id.as_str(), "o1");

        let again = matcher.assign(&descriptor("again", 2.0, 1024.0)).unwrap();
        assert_eq!(again.id.as_str(), "o2");

        assert!(matcher.offers().is_empty());
        assert!(matches!(
            matcher.assign(&descriptor("huge", 8.0, 1.0)),
            Err(MatchError::NoCapacity(_))
        ));
    }

    #[test]
    fn test_unused_offers_are_listed() {
        let mut matcher = FirstFitMatcher::new();
        matcher.add_offers(vec![
            Offer::new("o1", "a1", Resources::new(1.0, 256.0, 0.0)),
            Offer::new("o2", "a2", Resources::new(1.0, 256.0, 0.0)),
        ]);
        matcher.assign(&descriptor("t", 0.5, 64.0)).unwrap();

        let ids: Vec<_> = matcher.offers().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![OfferId::new("o2")]);

        matcher.clear_offers();
        assert!(!matcher.has_resources());
    }

    #[test]
    fn test_filters_restrict_placement() {
        let mut matcher = FirstFitMatcher::new();
        matcher.add_offers(vec![
            Offer::new("o1", "a1", Resources::new(2.0, 512.0, 0.0)).with_attribute("zone", "a"),
            Offer::new("o2", "a2", Resources::new(2.0, 512.0, 0.0)).with_attribute("zone", "b"),
        ]);

        matcher.add_filter(Constraint::new("zone", "b"));
        let placed = matcher.assign(&descriptor("t", 1.0, 64.0)).unwrap();
        assert_eq!(placed.agent_id.as_str(), "a2");

        matcher.clear_filters();
        matcher.add_filter(Constraint::new("zone", "c"));
        assert!(matches!(
            matcher.assign(&descriptor("u", 1.0, 64.0)),
            Err(MatchError::Constrained(_))
        ));

        matcher.clear_filters();
        matcher.add_filter(Constraint::new("hostname", "a1"));
        let placed = matcher.assign(&descriptor("v", 1.0, 64.0)).unwrap();
        assert_eq!(placed.id.as_str(), "o1");
    }
}
