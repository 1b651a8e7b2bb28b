//! Named hubs of one process

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{HubConfig, RtuConfig};
use crate::error::{Result, RtuError};
use crate::hub::Hub;
use crate::transport::{PortOpener, TokioSerialOpener};

/// Outcome of [`HubRegistry::connect_all`]
///
/// Rejected definitions come first, then every hub in configuration order.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub outcomes: Vec<(String, Result<()>)>,
}

impl StartupReport {
    pub fn connected(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &RtuError)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| outcome.as_ref().err().map(|e| (name.as_str(), e)))
            .collect()
    }

    /// True when every hub connected
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_ok())
    }
}

/// Hubs keyed by name, iterated in registration order
#[derive(Debug, Default)]
pub struct HubRegistry {
    hubs: Vec<Arc<Hub>>,
    index: HashMap<String, usize>,
    /// Definitions that never became a hub
    rejected: Vec<(String, RtuError)>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One hub per definition, on real serial ports
    pub fn from_config(config: &RtuConfig) -> Result<Self> {
        Self::from_config_with(config, |_| Arc::new(TokioSerialOpener) as Arc<dyn PortOpener>)
    }

    /// One hub per definition, each opened through the opener `opener_for` returns
    ///
    /// An invalid or duplicate definition is skipped and reported by
    /// [`connect_all`](Self::connect_all); its siblings are still built. Fails
    /// only when definitions exist and none of them is usable.
    pub fn from_config_with<F>(config: &RtuConfig, mut opener_for: F) -> Result<Self>
    where
        F: FnMut(&HubConfig) -> Arc<dyn PortOpener>,
    {
        let mut rejected: HashMap<usize, RtuError> = config.rejected().into_iter().collect();

        let mut registry = Self::new();
        for (position, definition) in config.hubs.iter().enumerate() {
            let built = match rejected.remove(&position) {
                Some(err) => Err(err),
                None => definition.serial_config().and_then(|serial| {
                    Hub::with_opener(definition.name.clone(), serial, opener_for(definition))
                }),
            };
            match built {
                Ok(hub) => {
                    registry.register(hub)?;
                },
                Err(e) => {
                    warn!("Hub definition '{}' skipped: {}", definition.name, e);
                    registry.rejected.push((definition.name.clone(), e));
                },
            }
        }

        if registry.is_empty() && !registry.rejected.is_empty() {
            return Err(RtuError::config(format!(
                "No usable hub definition, {} rejected",
                registry.rejected.len()
            )));
        }
        Ok(registry)
    }

    /// Definitions skipped while building, with the reason
    pub fn rejected(&self) -> &[(String, RtuError)] {
        &self.rejected
    }

    /// Add a hub; names are unique
    pub fn register(&mut self, hub: Hub) -> Result<Arc<Hub>> {
        if self.index.contains_key(hub.name()) {
            return Err(RtuError::config(format!(
                "Duplicate hub name '{}'",
                hub.name()
            )));
        }
        let hub = Arc::new(hub);
        self.index.insert(hub.name().to_string(), self.hubs.len());
        self.hubs.push(Arc::clone(&hub));
        Ok(hub)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Hub>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.hubs[i]))
            .ok_or_else(|| RtuError::UnknownHub(name.to_string()))
    }

    /// Hub names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.hubs.iter().map(|hub| hub.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Connect every hub in order; one failure does not stop the rest
    pub async fn connect_all(&self) -> StartupReport {
        let mut report = StartupReport::default();
        for (name, err) in &self.rejected {
            error!("Hub {} not started: {}", name, err);
            report.outcomes.push((name.clone(), Err(err.clone())));
        }
        for hub in &self.hubs {
            let outcome = hub.connect().await;
            if let Err(e) = &outcome {
                error!("Hub {} failed to start: {}", hub.name(), e);
            }
            report.outcomes.push((hub.name().to_string(), outcome));
        }

        let failed = report.failures().len();
        if failed == 0 {
            info!("All {} hubs connected", self.hubs.len());
        } else {
            warn!("{} of {} hubs failed to start", failed, report.outcomes.len());
        }
        report
    }

    /// Close every hub in order
    pub async fn close_all(&self) {
        for hub in &self.hubs {
            hub.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::SerialConfig;
    use crate::testing::MockBus;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
hubs:
  - name: north
    port: /dev/ttyMOCK0
    baudrate: 9600
    bytesize: 8
    parity: N
    stopbits: 1
  - name: south
    port: /dev/ttyMOCK1
    baudrate: 19200
    bytesize: 8
    parity: E
    stopbits: 1
  - name: west
    port: /dev/ttyMOCK2
    baudrate: 9600
    bytesize: 8
    parity: N
    stopbits: 1
"#;

    fn registry_with_buses() -> (HubRegistry, HashMap<String, MockBus>) {
        let config: RtuConfig = serde_yaml::from_str(CONFIG).unwrap();
        let mut buses = HashMap::new();
        let registry = HubRegistry::from_config_with(&config, |definition| {
            let bus = MockBus::new();
            buses.insert(definition.name.clone(), bus.clone());
            Arc::new(bus.opener()) as Arc<dyn PortOpener>
        })
        .unwrap();
        (registry, buses)
    }

    #[test]
    fn test_names_in_config_order() {
        let (registry, _) = registry_with_buses();
        assert_eq!(registry.names(), vec!["north", "south", "west"]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.lookup("south").unwrap().config().baud_rate, 19200);
    }

    #[test]
    fn test_unknown_hub() {
        let (registry, _) = registry_with_buses();
        assert_eq!(
            registry.lookup("east").unwrap_err(),
            RtuError::UnknownHub("east".to_string())
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = HubRegistry::new();
        let bus = MockBus::new();
        let hub = || {
            Hub::with_opener(
                "default",
                SerialConfig::new("/dev/ttyMOCK0"),
                Arc::new(bus.opener()),
            )
            .unwrap()
        };
        registry.register(hub()).unwrap();
        assert!(matches!(registry.register(hub()), Err(RtuError::Config(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_definition_spares_siblings() {
        let yaml = CONFIG.replace(
            "  - name: south\n    port: /dev/ttyMOCK1\n",
            "  - name: south\n    timeout: 0\n    port: /dev/ttyMOCK1\n",
        ) + "  - name: north\n    port: /dev/ttyMOCK3\n    baudrate: 9600\n    bytesize: 8\n    parity: N\n    stopbits: 1\n";
        let config: RtuConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.hubs.len(), 4);

        let mut opened = Vec::new();
        let registry = HubRegistry::from_config_with(&config, |definition| {
            opened.push(definition.port.clone());
            Arc::new(MockBus::new().opener()) as Arc<dyn PortOpener>
        })
        .unwrap();
        assert_eq!(opened, vec!["/dev/ttyMOCK0", "/dev/ttyMOCK2"]);
        assert_eq!(registry.names(), vec!["north", "west"]);
        assert_eq!(registry.lookup("north").unwrap().config().device, "/dev/ttyMOCK0");
        assert_eq!(registry.rejected().len(), 2);

        let report = registry.connect_all().await;
        assert_eq!(report.connected(), vec!["north", "west"]);
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, "south");
        assert!(matches!(failures[0].1, RtuError::Config(_)));
        assert_eq!(failures[1].0, "north");
        assert!(matches!(failures[1].1, RtuError::Config(ref msg) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_no_usable_definition() {
        let mut config: RtuConfig = serde_yaml::from_str(CONFIG).unwrap();
        for hub in &mut config.hubs {
            hub.stopbits = 3;
        }
        assert!(matches!(
            HubRegistry::from_config_with(&config, |_| {
                Arc::new(MockBus::new().opener()) as Arc<dyn PortOpener>
            }),
            Err(RtuError::Config(_))
        ));

        let empty = RtuConfig::default();
        assert!(HubRegistry::from_config(&empty).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_startup() {
        let (registry, buses) = registry_with_buses();
        buses["south"].fail_open("Permission denied");

        let report = registry.connect_all().await;
        assert!(!report.is_complete());
        assert_eq!(report.connected(), vec!["north", "west"]);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "south");

        assert!(registry.lookup("west").unwrap().is_connected().await);

        registry.close_all().await;
        registry.close_all().await;
        for name in registry.names() {
            assert!(!registry.lookup(name).unwrap().is_connected().await);
        }
    }
}
