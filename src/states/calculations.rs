//! Kinetics calculations that read and write recorded states.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use super::CellStateManager;
use crate::error::{AppError, AppResult};
use crate::kinetics::{
    calc_cumulative_pd, calc_doubling_time_hours, calc_generation, elapsed_hours,
    try_calculate_measured_parameters,
};
use crate::storage::{CellState, StatePatch, Storage};

/// Pair of states to derive measured growth parameters from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasuredParametersRequest {
    pub start_state_id: i64,
    pub end_state_id: i64,
}

/// Measured growth parameters, as merged into the end state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredParametersResult {
    pub measured_growth_rate: Option<f64>,
    pub measured_doubling_time: Option<f64>,
    pub measured_density_limit: Option<f64>,
    pub start_state_id: i64,
    pub end_state_id: i64,
    pub start_density: f64,
    pub end_density: f64,
    pub time_elapsed_hours: f64,
    pub success: bool,
    pub message: String,
}

/// Seed and harvest counts observed for one state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationDoublingsRequest {
    pub state_id: i64,
    pub seed_count: f64,
    pub harvest_count: f64,
}

/// Population doublings recorded for a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationDoublingsResult {
    pub state_id: i64,
    pub parent_id: Option<i64>,
    pub generation: f64,
    pub cumulative_pd: Option<f64>,
    pub doubling_time_hours: Option<f64>,
}

impl CellStateManager {
    /// Derive measured growth parameters from two states' densities and
    /// store them on the end state.
    pub async fn calculate_measured_parameters(
        &self,
        request: &MeasuredParametersRequest,
    ) -> AppResult<MeasuredParametersResult> {
        let start = self.require(request.start_state_id).await?;
        let end = self.require(request.end_state_id).await?;

        let start_density = required_density(&start, "start_state_id")?;
        let end_density = required_density(&end, "end_state_id")?;

        let measured = try_calculate_measured_parameters(
            start_density,
            end_density,
            start.timestamp,
            end.timestamp,
        )?;
        let hours = elapsed_hours(start.timestamp, end.timestamp);

        let mut update = Map::new();
        update.insert("measured_growth_rate".to_string(), json!(measured.growth_rate));
        update.insert("measured_doubling_time".to_string(), json!(measured.doubling_time));
        update.insert("measured_density_limit".to_string(), json!(measured.density_limit));
        self.apply_patch(end.id, &StatePatch::parameters(update)).await?;

        let (success, message) = if measured.is_empty() {
            (false, "Density decreased; growth parameters were not derived".to_string())
        } else {
            (true, "Measured parameters calculated and stored".to_string())
        };

        info!(
            start_state_id = start.id,
            end_state_id = end.id,
            growth_rate = ?measured.growth_rate,
            hours,
            "Measured parameters recorded"
        );

        Ok(MeasuredParametersResult {
            measured_growth_rate: measured.growth_rate,
            measured_doubling_time: measured.doubling_time,
            measured_density_limit: measured.density_limit,
            start_state_id: start.id,
            end_state_id: end.id,
            start_density,
            end_density,
            time_elapsed_hours: hours,
            success,
            message,
        })
    }

    /// Compute population doublings from seed and harvest counts and store
    /// them, with the cumulative total and doubling time, on the state.
    pub async fn record_population_doublings(
        &self,
        request: &PopulationDoublingsRequest,
    ) -> AppResult<PopulationDoublingsResult> {
        let generation = calc_generation(request.seed_count, request.harvest_count)?;
        let state = self.require(request.state_id).await?;

        let parent = match state.parent_id {
            Some(parent_id) => self.storage.get_state(parent_id).await?,
            None => None,
        };

        let parent_pd = parent.as_ref().and_then(|p| p.numeric_parameter("cumulative_pd"));
        let cumulative_pd = calc_cumulative_pd(Some(generation), parent_pd);
        let doubling_time_hours = parent
            .as_ref()
            .filter(|p| p.timestamp < state.timestamp)
            .and_then(|p| calc_doubling_time_hours(p.timestamp, state.timestamp, generation));

        let mut update = Map::new();
        update.insert("seed_count".to_string(), json!(request.seed_count));
        update.insert("harvest_count".to_string(), json!(request.harvest_count));
        update.insert("generation".to_string(), json!(generation));
        update.insert("cumulative_pd".to_string(), json!(cumulative_pd));
        update.insert("doubling_time_hours".to_string(), json!(doubling_time_hours));
        self.apply_patch(state.id, &StatePatch::parameters(update)).await?;

        info!(
            state_id = state.id,
            generation,
            cumulative_pd = ?cumulative_pd,
            "Population doublings recorded"
        );

        Ok(PopulationDoublingsResult {
            state_id: state.id,
            parent_id: state.parent_id,
            generation,
            cumulative_pd,
            doubling_time_hours,
        })
    }
}

fn required_density(state: &CellState, field: &str) -> AppResult<f64> {
    match state.parameters.get("cell_density").and_then(Value::as_f64) {
        Some(density) if density > 0.0 => Ok(density),
        Some(_) => Err(AppError::validation(
            field,
            format!("state {} has a non-positive cell_density", state.id),
        )),
        None => Err(AppError::validation(
            field,
            format!("state {} has no numeric cell_density", state.id),
        )),
    }
}
