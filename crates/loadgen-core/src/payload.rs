use crate::device::Device;
use crate::protocol::Protocol;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Builds the body of each message a worker sends.
pub trait PayloadGenerator: Send + Sync {
    fn generate(
        &self,
        device: &Device,
        protocol: Protocol,
        message_count: u64,
        rng: &mut ChaCha8Rng,
    ) -> Vec<u8>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub device_id: String,
    pub tenant_id: String,
    pub timestamp: i64,
    pub message_count: u64,
    pub protocol: Protocol,
    pub kind: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub battery: f64,
    pub signal_strength: i32,
}

/// Synthetic sensor readings serialized as JSON.
#[derive(Debug, Clone)]
pub struct TelemetryGenerator {
    kind: String,
}

impl TelemetryGenerator {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn build(
        &self,
        device: &Device,
        protocol: Protocol,
        message_count: u64,
        rng: &mut ChaCha8Rng,
    ) -> TelemetryPayload {
        TelemetryPayload {
            device_id: device.device_id.clone(),
            tenant_id: device.tenant_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            message_count,
            protocol,
            kind: self.kind.clone(),
            temperature: round2(rng.gen_range(18.0..=35.0)),
            humidity: round2(rng.gen_range(30.0..=90.0)),
            pressure: round2(rng.gen_range(980.0..=1030.0)),
            battery: round2(rng.gen_range(20.0..=100.0)),
            signal_strength: rng.gen_range(-100..=-30),
        }
    }
}

impl PayloadGenerator for TelemetryGenerator {
    fn generate(
        &self,
        device: &Device,
        protocol: Protocol,
        message_count: u64,
        rng: &mut ChaCha8Rng,
    ) -> Vec<u8> {
        let payload = self.build(device, protocol, message_count, rng);
        // Plain structs with string/number fields always serialize
        serde_json::to_vec(&payload).unwrap_or_default()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_telemetry_ranges() {
        let generator = TelemetryGenerator::new("telemetry");
        let device = Device::new("d1", "t1", "pw");
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        for i in 0..200 {
            let p = generator.build(&device, Protocol::Mqtt, i, &mut rng);
            assert_eq!(p.message_count, i);
            assert!((18.0..=35.0).contains(&p.temperature));
            assert!((30.0..=90.0).contains(&p.humidity));
            assert!((980.0..=1030.0).contains(&p.pressure));
            assert!((20.0..=100.0).contains(&p.battery));
            assert!((-100..=-30).contains(&p.signal_strength));
        }
    }

    #[test]
    fn test_generate_json_bytes() {
        let generator = TelemetryGenerator::new("event");
        let device = Device::new("d9", "t2", "pw");
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let bytes = generator.generate(&device, Protocol::Http, 5, &mut rng);
        let decoded: TelemetryPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.device_id, "d9");
        assert_eq!(decoded.tenant_id, "t2");
        assert_eq!(decoded.kind, "event");
        assert_eq!(decoded.protocol, Protocol::Http);
    }
}
