use std::time::Duration;

/// Settings of a bus master bound to one serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMasterSettings {
    /// Name of the serial port the passive adapter is attached to.
    pub serial_port_name: String,
    /// Bound on internal device operations (configuration writes, temperature refresh).
    pub operation_timeout: Duration,
    /// Default time budget of a bus search.
    pub search_time_limit: Duration,
    /// Bound on initializing one discovered device.
    pub init_timeout: Duration,
}

impl BusMasterSettings {
    /// Settings for `serial_port_name` with default timeouts.
    pub fn new(serial_port_name: impl Into<String>) -> Self {
        Self {
            serial_port_name: serial_port_name.into(),
            operation_timeout: Duration::from_secs(2),
            search_time_limit: Duration::from_secs(1),
            init_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the bound on internal device operations.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the default search time budget.
    pub fn with_search_time_limit(mut self, limit: Duration) -> Self {
        self.search_time_limit = limit;
        self
    }

    /// Sets the bound on initializing one device.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }
}
