//! Bounded-parallelism counter

/// Counting gate: at most `limit` holders at a time
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    limit: usize,
    in_flight: usize,
    peak: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self { limit, in_flight: 0, peak: 0 }
    }

    /// Whether another holder may enter
    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.limit
    }

    /// Take a slot; returns `false` when the gate is full
    pub fn enter(&mut self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.in_flight += 1;
        self.peak = self.peak.max(self.in_flight);
        true
    }

    /// Return a slot; returns `false` if no slot was held
    pub fn leave(&mut self) -> bool {
        match self.in_flight.checked_sub(1) {
            Some(in_flight) => {
                self.in_flight = in_flight;
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Highest `in_flight` value observed
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_flight)
    }
}
