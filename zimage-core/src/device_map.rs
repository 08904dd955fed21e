/// Which compute device the engine should be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    /// Builds the map from the worker's `--cpu` / `--device-ordinal` settings.
    pub fn from_settings(force_cpu: bool, ordinal: usize) -> Self {
        if force_cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}
