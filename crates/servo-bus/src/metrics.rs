use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct BusMetrics {
    pub tx_packets: IntCounter,
    pub rx_packets: IntCounter,
    pub comm_errors: IntCounter,
    pub framing_errors: IntCounter,
    pub device_errors: IntCounter,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bus: BusMetrics,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let bus = BusMetrics {
            tx_packets: counter("scs_tx_packets", "Instruction packets written to the bus")?,
            rx_packets: counter("scs_rx_packets", "Status packets decoded from the bus")?,
            comm_errors: counter(
                "scs_comm_errors",
                "Transactions that ended without a valid status packet",
            )?,
            framing_errors: counter(
                "scs_framing_errors",
                "Status packets rejected for framing or checksum",
            )?,
            device_errors: counter(
                "scs_device_errors",
                "Status packets carrying nonzero error flags",
            )?,
        };
        let _ = registry.register(Box::new(bus.tx_packets.clone()));
        let _ = registry.register(Box::new(bus.rx_packets.clone()));
        let _ = registry.register(Box::new(bus.comm_errors.clone()));
        let _ = registry.register(Box::new(bus.framing_errors.clone()));
        let _ = registry.register(Box::new(bus.device_errors.clone()));
        Ok(Self { registry, bus })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_as_text() -> Result<(), String> {
        let hub = MetricsHub::new()?;
        hub.bus.tx_packets.inc();
        hub.bus.tx_packets.inc();
        let text = hub.encode_text();
        assert!(text.contains("scs_tx_packets 2"));
        assert!(text.contains("scs_device_errors 0"));
        Ok(())
    }
}
