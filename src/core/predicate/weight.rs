//! Weighted route groups.
//!
//! Routes carrying a `weight` predicate register `(group, route id, weight)`
//! here while a snapshot is built. Per request, every group gets one random
//! draw that picks a route id; the `weight` atoms then only match the
//! chosen route. A choice already present on the exchange is kept.
use rand::Rng;

use crate::core::exchange::Exchange;

#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    groups: Vec<WeightGroup>,
}

#[derive(Debug, Clone)]
struct WeightGroup {
    name: String,
    routes: Vec<(String, u32)>,
    // Cumulative upper bounds in [0, 1], parallel to `routes`.
    bounds: Vec<f64>,
}

impl WeightGroup {
    fn recompute(&mut self) {
        let total: u64 = self.routes.iter().map(|(_, weight)| u64::from(*weight)).sum();
        self.bounds.clear();
        if total == 0 {
            return;
        }
        let mut cumulative = 0u64;
        for (_, weight) in &self.routes {
            cumulative += u64::from(*weight);
            self.bounds.push(cumulative as f64 / total as f64);
        }
    }
}

impl WeightTable {
    pub fn insert(&mut self, group: &str, route_id: &str, weight: u32) {
        let index = match self.groups.iter().position(|g| g.name == group) {
            Some(index) => index,
            None => {
                self.groups.push(WeightGroup {
                    name: group.to_string(),
                    routes: Vec::new(),
                    bounds: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        let entry = &mut self.groups[index];
        match entry.routes.iter_mut().find(|(id, _)| id == route_id) {
            Some(existing) => existing.1 = weight,
            None => entry.routes.push((route_id.to_string(), weight)),
        }
        entry.recompute();
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Route id selected by `draw` (in `[0, 1)`) within `group`.
    pub fn choose(&self, group: &str, draw: f64) -> Option<&str> {
        let group = self.groups.iter().find(|g| g.name == group)?;
        let index = group
            .bounds
            .iter()
            .position(|bound| draw < *bound)
            .or_else(|| group.bounds.len().checked_sub(1))?;
        group.routes.get(index).map(|(id, _)| id.as_str())
    }

    /// Record a choice for every group the exchange has not chosen for yet.
    pub fn assign<R: Rng>(&self, exchange: &mut Exchange, rng: &mut R) {
        for group in &self.groups {
            if exchange.attributes().weights.contains_key(&group.name) {
                continue;
            }
            let draw: f64 = rng.random();
            if let Some(route_id) = self.choose(&group.name, draw) {
                tracing::trace!(group = %group.name, route = route_id, draw, "Weight group resolved");
                exchange
                    .attributes_mut()
                    .weights
                    .insert(group.name.clone(), route_id.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Method, Uri};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::core::exchange::GatewayRequest;

    fn table() -> WeightTable {
        let mut table = WeightTable::default();
        table.insert("group1", "high", 8);
        table.insert("group1", "low", 2);
        table
    }

    #[test]
    fn test_choose_by_cumulative_ranges() {
        let table = table();
        assert_eq!(table.choose("group1", 0.0), Some("high"));
        assert_eq!(table.choose("group1", 0.79), Some("high"));
        assert_eq!(table.choose("group1", 0.8), Some("low"));
        assert_eq!(table.choose("group1", 0.99), Some("low"));
        assert_eq!(table.choose("missing", 0.5), None);
    }

    #[test]
    fn test_zero_weights_never_choose() {
        let mut table = WeightTable::default();
        table.insert("g", "a", 0);
        assert_eq!(table.choose("g", 0.5), None);
    }

    #[test]
    fn test_existing_choice_is_sticky() {
        let table = table();
        let mut exchange = Exchange::new(
            GatewayRequest::new(Method::GET, Uri::from_static("/")),
            Body::empty(),
        );
        exchange
            .attributes_mut()
            .weights
            .insert("group1".to_string(), "low".to_string());

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            table.assign(&mut exchange, &mut rng);
            assert_eq!(exchange.attributes().weights["group1"], "low");
        }
    }

    #[test]
    fn test_distribution_follows_weights() {
        let table = table();
        let mut rng = StdRng::seed_from_u64(42);
        let mut high = 0;
        for _ in 0..1000 {
            let mut exchange = Exchange::new(
                GatewayRequest::new(Method::GET, Uri::from_static("/")),
                Body::empty(),
            );
            table.assign(&mut exchange, &mut rng);
            if exchange.attributes().weights["group1"] == "high" {
                high += 1;
            }
        }
        assert!((700..=900).contains(&high), "high chosen {high} times");
    }
}
