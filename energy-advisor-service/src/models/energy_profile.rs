use serde::Deserialize;
use validator::{Validate, ValidationErrors};

/// Body of `POST /chat`, as sent by clients.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation failure rather than a parse failure.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnergyProfileRequest {
    #[validate(required(message = "totalEnergyConsumption is required"))]
    pub total_energy_consumption: Option<f64>,
    #[validate(required(message = "productNames is required"))]
    pub product_names: Option<Vec<String>>,
    #[validate(required(message = "powerRatings is required"))]
    pub power_ratings: Option<Vec<f64>>,
    #[serde(default)]
    pub hours: Option<Vec<f64>>,
}

/// Validated household energy usage for one request.
///
/// The per-device sequences are read index by index but their lengths are
/// not required to match.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyProfile {
    /// kWh over the past month.
    pub total_energy_consumption: f64,
    pub product_names: Vec<String>,
    /// Watts.
    pub power_ratings: Vec<f64>,
    /// Daily usage hours per device.
    pub hours: Option<Vec<f64>>,
}

impl EnergyProfileRequest {
    pub fn into_profile(self) -> Result<EnergyProfile, ValidationErrors> {
        self.validate()?;

        match (
            self.total_energy_consumption,
            self.product_names,
            self.power_ratings,
        ) {
            (Some(total_energy_consumption), Some(product_names), Some(power_ratings)) => {
                Ok(EnergyProfile {
                    total_energy_consumption,
                    product_names,
                    power_ratings,
                    hours: self.hours,
                })
            }
            // validate() has already rejected every missing field.
            _ => Err(ValidationErrors::new()),
        }
    }
}
