//! Catalog of panel types, keyed by display name.

use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeMap;

use crate::config::PanelSettings;
use crate::error::RegistryError;
use crate::modalities;
use crate::panel::{Capability, ModalityPanel};

pub type PanelBuilder = fn(&PanelSettings) -> Result<Box<dyn ModalityPanel>>;
pub type PanelProbe = fn() -> Result<()>;

/// Static description of one panel type.
#[derive(Clone)]
pub struct PanelDescriptor {
    /// snake_case source identifier, e.g. `dream_incubator`.
    pub identifier: &'static str,
    pub capability: Capability,
    /// Dependency check run at discovery; a failing probe drops the panel.
    pub probe: Option<PanelProbe>,
    pub build: PanelBuilder,
}

impl PanelDescriptor {
    pub fn name(&self) -> String {
        camel_case(self.identifier)
    }
}

/// `dream_incubator` -> `DreamIncubator`.
pub fn camel_case(identifier: &str) -> String {
    identifier
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

pub struct PanelRegistry {
    panels: BTreeMap<String, PanelDescriptor>,
    skipped: Vec<(String, String)>,
    warnings: Vec<String>,
}

impl PanelRegistry {
    pub fn discover<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = PanelDescriptor>,
    {
        let mut registry = Self {
            panels: BTreeMap::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
        };
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        info!("Registered panels: {:?}", registry.names());
        registry
    }

    /// The catalog of panels shipped with this crate.
    pub fn builtin() -> Self {
        Self::discover(modalities::catalog())
    }

    pub fn register(&mut self, descriptor: PanelDescriptor) {
        let name = descriptor.name();
        if let Some(probe) = descriptor.probe {
            if let Err(err) = probe() {
                warn!("skipping panel {}: {:#}", name, err);
                self.skipped.push((name, format!("{:#}", err)));
                return;
            }
        }
        if self.panels.contains_key(&name) {
            let message = format!(
                "panel name '{}' declared twice; keeping '{}'",
                name, descriptor.identifier
            );
            warn!("{}", message);
            self.warnings.push(message);
        }
        self.panels.insert(name, descriptor);
    }

    pub fn available(&self) -> BTreeMap<String, &PanelDescriptor> {
        self.panels
            .iter()
            .map(|(name, descriptor)| (name.clone(), descriptor))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.panels.keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&PanelDescriptor> {
        self.panels.get(name)
    }

    pub fn instantiate(
        &self,
        name: &str,
        settings: &PanelSettings,
    ) -> Result<Box<dyn ModalityPanel>, RegistryError> {
        let descriptor = self
            .panels
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        (descriptor.build)(settings).map_err(|source| RegistryError::Build {
            name: name.to_string(),
            source,
        })
    }

    /// Panels dropped at discovery, with the reason.
    pub fn skipped(&self) -> &[(String, String)] {
        &self.skipped
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::PanelStatus;
    use anyhow::anyhow;

    struct Stub(&'static str);

    impl ModalityPanel for Stub {
        fn kind(&self) -> &str {
            self.0
        }

        fn status(&self) -> PanelStatus {
            PanelStatus::Idle
        }
    }

    fn build_stub(_: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
        Ok(Box::new(Stub("SpaceNote")))
    }

    fn build_other(_: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
        Ok(Box::new(Stub("Other")))
    }

    fn build_broken(_: &PanelSettings) -> Result<Box<dyn ModalityPanel>> {
        Err(anyhow!("no device"))
    }

    fn missing_dependency() -> Result<()> {
        Err(anyhow!("libfoo not installed"))
    }

    fn descriptor(identifier: &'static str, build: PanelBuilder) -> PanelDescriptor {
        PanelDescriptor {
            identifier,
            capability: Capability::RecordsToFile,
            probe: None,
            build,
        }
    }

    #[test]
    fn camel_cases_identifiers() {
        assert_eq!(camel_case("dream_incubator"), "DreamIncubator");
        assert_eq!(camel_case("eeg"), "Eeg");
        assert_eq!(camel_case("space__note_"), "SpaceNote");
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = PanelRegistry::discover([descriptor("space_note", build_stub)]);
        let err = registry
            .instantiate("Nope", &PanelSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::NotFound(name) if name == "Nope"));
        let panel = registry
            .instantiate("SpaceNote", &PanelSettings::default())
            .unwrap();
        assert_eq!(panel.kind(), "SpaceNote");
    }

    #[test]
    fn failing_probe_is_skipped_not_fatal() {
        let mut broken = descriptor("needs_lib", build_stub);
        broken.probe = Some(missing_dependency);
        let registry = PanelRegistry::discover([broken, descriptor("space_note", build_stub)]);
        assert_eq!(registry.names(), vec!["SpaceNote"]);
        assert_eq!(registry.skipped().len(), 1);
        assert_eq!(registry.skipped()[0].0, "NeedsLib");
    }

    #[test]
    fn collisions_are_last_write_wins_with_warning() {
        let registry = PanelRegistry::discover([
            descriptor("space_note", build_stub),
            descriptor("SPACE_note", build_other),
        ]);
        assert_eq!(registry.names(), vec!["SpaceNote"]);
        assert_eq!(registry.warnings().len(), 1);
        let panel = registry
            .instantiate("SpaceNote", &PanelSettings::default())
            .unwrap();
        assert_eq!(panel.kind(), "Other");
    }

    #[test]
    fn build_errors_are_reported() {
        let registry = PanelRegistry::discover([descriptor("broken", build_broken)]);
        let err = registry
            .instantiate("Broken", &PanelSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Build { .. }));
    }

    #[test]
    fn builtin_catalog_is_deterministic() {
        let first = PanelRegistry::builtin().names();
        let second = PanelRegistry::builtin().names();
        assert_eq!(first, second);
        assert!(first.contains(&"DreamIncubator".to_string()));
        assert!(first.contains(&"Osc".to_string()));
    }
}
