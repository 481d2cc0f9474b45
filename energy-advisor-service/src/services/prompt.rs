//! Prompt rendering for energy profiles. Pure functions, no I/O.

use crate::models::EnergyProfile;
use crate::services::providers::ChatPrompt;

pub const SYSTEM_INSTRUCTION: &str = "You are a household energy efficiency advisor. \
Give concrete, practical recommendations grounded in the appliance data you are given. \
Quantify savings where you can and keep the advice specific to each device.";

/// Render the system instruction and user prompt for one profile.
pub fn build_prompt(profile: &EnergyProfile) -> ChatPrompt {
    ChatPrompt::new(render_user_prompt(profile)).with_system(SYSTEM_INSTRUCTION)
}

pub fn render_user_prompt(profile: &EnergyProfile) -> String {
    let mut prompt = String::from(
        "Based on the energy consumption data for the past month, I have the following details:\n\n",
    );

    prompt.push_str(&format!(
        "- Total energy consumption: {} kWh\n",
        profile.total_energy_consumption
    ));
    prompt.push_str(&format!(
        "- Products: {} (e.g., LED bulbs, AC units, etc.)\n",
        profile.product_names.join(", ")
    ));
    prompt.push_str(&format!(
        "- Power ratings (in watts): {} (e.g., 10W, 50W, etc.)\n",
        join_numbers(&profile.power_ratings)
    ));
    if let Some(hours) = &profile.hours {
        prompt.push_str(&format!(
            "- Daily usage (in hours): {}\n",
            join_numbers(hours)
        ));
    }

    prompt.push_str(
        "\nI have already switched to energy-efficient devices like LED lightbulbs. \
However, I am looking for further ways to optimize energy use and reduce unnecessary consumption. \
Could you provide a detailed recommendation on how to further optimize my energy consumption? \
Include practical tips for each device type, potential cost savings, \
and any overlooked opportunities for further improvement.",
    );

    prompt
}

fn join_numbers(values: &[f64]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
