use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferrite_tpt::model::text_encoder::HashedTextEncoder;
use ferrite_tpt::tta::run_config::OptimizerKind;
use ferrite_tpt::{
    AdaptationLoop, Backbone, CaptionBridge, CaptionEnsemble, EnsemblePolicy, PromptClassifier,
    PrototypeCaptioner, RunConfig, VecStream,
};

const INPUT: usize = 24;
const VIEWS: usize = 16;

fn main() -> ferrite_tpt::Result<()> {
    let classes: Vec<String> = ["tabby cat", "golden retriever", "red fox", "barn owl", "goldfish"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut rng = StdRng::seed_from_u64(7);
    let centers: Vec<Vec<f64>> = (0..classes.len())
        .map(|_| (0..INPUT).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    // Each sample: a noisy draw around its class centre plus noisier views.
    let samples: Vec<(Vec<Vec<f64>>, usize)> = (0..60)
        .map(|i| {
            let label = i % classes.len();
            let base: Vec<f64> = centers[label].iter().map(|c| c + rng.gen_range(-0.6..0.6)).collect();
            let mut views = vec![base.clone()];
            for _ in 1..VIEWS {
                views.push(base.iter().map(|x| x + rng.gen_range(-0.4..0.4)).collect());
            }
            (views, label)
        })
        .collect();

    for ensemble in [false, true] {
        let config = RunConfig {
            run_name: format!("synthetic-ensemble-{}", ensemble),
            runs_dir: std::env::temp_dir().join("ferrite-tpt-demo"),
            views: VIEWS,
            percentile: 25.0,
            ensemble,
            ensemble_policy: EnsemblePolicy::Entropy,
            optimizer: OptimizerKind::AdamW,
            log_frequency: 20,
            ..RunConfig::default()
        };

        let backbone = PromptClassifier::new(classes.clone(), INPUT, 32, "a photo of a", 11)?;
        let optimizer = config.optimizer.build(config.learning_rate);
        let mut tta = AdaptationLoop::new(backbone, optimizer, config.clone())?;

        if ensemble {
            let prototypes = classes.iter().cloned().zip(centers.iter().cloned()).collect();
            let captioner = PrototypeCaptioner::new(prototypes, HashedTextEncoder::new(32, 11), 100f64.ln())?;
            let bridge = CaptionBridge::new(tta.backbone().class_names(), config.caption_prefix.clone());
            tta = tta.with_ensemble(CaptionEnsemble::new(
                config.ensemble_policy,
                classes.len(),
                bridge,
                Box::new(captioner),
            ));
        }

        let outcome = tta.run(&mut VecStream::new(samples.clone()), None)?;
        println!(
            "ensemble={:<5} top1 no-adapt = {:6.2}%  adapted = {:6.2}%  top5 = {:6.2}%  ({})",
            ensemble,
            outcome.stats.no_adapt_top1(),
            outcome.stats.top1.get_avg(),
            outcome.stats.top5.get_avg(),
            config.run_dir().display()
        );
    }
    Ok(())
}
