use crate::workflow::config::PipelineConfig;
use anyhow::Context;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rfcore::source::{make_transient_params, TransientOverrides};
use rfcore::state::State;

/// Draws `config.ntransients` random transients and adds them to the
/// state's injection list. Returns the total number to be injected.
pub fn build_transients(config: &PipelineConfig, state: &mut State) -> anyhow::Result<usize> {
    if config.ntransients > 0 {
        let mut rng = StdRng::seed_from_u64(state.prefs.seed);
        let mocks = make_transient_params(
            state,
            config.ntransients,
            &TransientOverrides::default(),
            None,
            &mut rng,
        )
        .context("drawing simulated transients")?;
        for mock in &mocks {
            info!(
                "Simulating transient in segment {} at int {} with DM {:.1}, amp {:.3}",
                mock.segment, mock.integration, mock.dm, mock.amp
            );
        }
        state.prefs.simulated_transient.extend(mocks);
    }
    Ok(state.prefs.simulated_transient.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::config::ObservationConfig;

    fn small_config(ntransients: usize) -> PipelineConfig {
        let obs = ObservationConfig {
            nants: 6,
            chans: 16,
            duration_s: 0.5,
            ..Default::default()
        };
        PipelineConfig::from_args(obs, 0.0, 7.0, ntransients, 4)
    }

    #[test]
    fn transients_are_added_to_preferences() {
        let config = small_config(3);
        let mut state = State::new(config.to_metadata().unwrap(), config.preferences.clone()).unwrap();
        assert_eq!(build_transients(&config, &mut state).unwrap(), 3);
        assert!(state
            .prefs
            .simulated_transient
            .iter()
            .all(|tr| tr.segment < state.nsegment()));
    }

    #[test]
    fn no_transients_requested_leaves_state_untouched() {
        let config = small_config(0);
        let mut state = State::new(config.to_metadata().unwrap(), config.preferences.clone()).unwrap();
        assert_eq!(build_transients(&config, &mut state).unwrap(), 0);
    }
}
