//! Cost accounting: flat per-token pricing plus per-invocation surcharges.

/// Pricing model for completed sessions.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub price_per_token: f64,
}

impl CostModel {
    pub fn new(price_per_token: f64) -> Self {
        Self { price_per_token }
    }

    /// Cost of one session: price × (input + output tokens) + surcharges.
    pub fn session_cost(&self, total_tokens: u64, surcharges: f64) -> f64 {
        self.price_per_token * total_tokens as f64 + surcharges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pricing_with_surcharge() {
        let model = CostModel::new(0.001);
        let cost = model.session_cost(1500, 0.25);
        assert!((cost - 1.75).abs() < 1e-9);
    }

    #[test]
    fn zero_tokens_costs_only_surcharge() {
        let model = CostModel::new(0.001);
        assert_eq!(model.session_cost(0, 0.0), 0.0);
        assert!((model.session_cost(0, 0.05) - 0.05).abs() < 1e-12);
    }
}
