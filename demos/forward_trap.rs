//! Forward selection stuck in a local optimum, compared with FAMoS and an
//! exhaustive search on the same landscape.
//!
//! Run with `cargo run --example forward_trap`.

use model_select::{
    schema::{AxisSpec, CriterionKind, FamosConfig, ProblemConfig, SearchMethod, SubspaceSpec},
    select::{Problem, SearchError, SyntheticCalibrator},
};

fn main() -> Result<(), SearchError> {
    env_logger::init();

    let subspace = SubspaceSpec {
        id: "M".to_string(),
        base: "model.xml".to_string(),
        dataset: None,
        axes: vec![
            AxisSpec::toggle("a", 0.0),
            AxisSpec::toggle("b", 0.0),
            AxisSpec::toggle("c", 0.0),
        ],
    };

    // b and c only pay off together.
    let calibrator = SyntheticCalibrator::new(100.0, 100)
        .with_effect("a", -3.0)
        .with_effect("b", -0.5)
        .with_effect("c", -0.5)
        .with_interaction(&["b", "c"], -20.0);

    for method in [
        SearchMethod::default(),
        SearchMethod::Famos(FamosConfig::default()),
        SearchMethod::BruteForce,
    ] {
        let name = method.name();
        let config = ProblemConfig::new(CriterionKind::Aic, method, vec![subspace.clone()]);
        let mut problem = Problem::new(config)?;
        let result = problem.run_to_completion(&calibrator)?;

        let Some(best) = &result.incumbent else {
            println!("{name:>12}: no model calibrated");
            continue;
        };
        let aic = best.get_criterion(CriterionKind::Aic)?.value;
        println!(
            "{name:>12}: {} AIC={aic:.1} after {} calibration(s), {}",
            best.label(),
            result.stats.calibrated,
            result.phase
        );
    }

    Ok(())
}
