pub mod energy_profile;

pub use energy_profile::{EnergyProfile, EnergyProfileRequest};
