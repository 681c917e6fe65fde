/// Runtime switches of a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Range-check host transfers and dispatch arguments at the call site.
    pub validate: bool,
    /// Seed of the generator every weight initializer draws from.
    pub seed: u64,
    /// Time every pass.
    pub profile: bool,
}

impl NetworkConfig {
    pub const DEFAULT_SEED: u64 = 99;

    /// Skips validation, for measured runs.
    pub fn release() -> Self {
        Self { validate: false, ..Self::default() }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            validate: true,
            seed: Self::DEFAULT_SEED,
            profile: false,
        }
    }
}
