use std::{f64::consts::PI, path::Path};

use approx::assert_relative_eq;
use hzz4l::{
    config::AnalysisConfig,
    data::{
        io::{write_parquet, DatasetIoOptions},
        Dataset, Event, Lepton,
    },
    fit::significance,
    histograms::HistogramSet,
    model::Model,
    pipeline,
    workspace::Workspace,
    Float, Variation,
};

/// Four massless leptons at rest in the transverse plane with invariant mass `mass`.
fn event_at(mass: Float, type_ids: [i32; 4]) -> Event {
    let p = mass / 4.0;
    Event::new(vec![
        Lepton::new(p, 0.0, 0.0, p, 1, type_ids[0]),
        Lepton::new(p, 0.0, PI, p, -1, type_ids[1]),
        Lepton::new(p, 0.0, PI / 2.0, p, 1, type_ids[2]),
        Lepton::new(p, 0.0, -PI / 2.0, p, -1, type_ids[3]),
    ])
}

fn signal() -> Vec<Event> {
    (0..20).map(|_| event_at(127.5, [11, 11, 13, 13])).collect()
}

/// Three events at the center of each of the 34 bins between 80 and 250 GeV.
fn background() -> Vec<Event> {
    (0..34)
        .flat_map(|bin| {
            let mass = 82.5 + 5.0 * bin as Float;
            [
                event_at(mass, [13, 13, 13, 13]),
                event_at(mass, [11, 11, 11, 11]),
                event_at(mass, [11, 11, 13, 13]),
            ]
        })
        .collect()
}

fn write(dir: &Path, name: &str, events: Vec<Event>) {
    let path = dir.join(name);
    write_parquet(
        &Dataset::new(events),
        path.to_str().unwrap(),
        &DatasetIoOptions::default(),
    )
    .unwrap();
}

const CONFIG: &str = r#"
General:
  Measurement: HZZ
  POI: Signal_norm
  HistogramPath: out/histograms.bin
  WorkspacePath: out/workspace.json
  Luminosity: 10.0
  Binning: { Bins: 34, Low: 80.0, High: 250.0 }
Regions:
  - Name: Signal_region
Samples:
  - Name: Data
    Data: true
    Files:
      - Path: data_A.parquet
      - Path: data_B.parquet
  - Name: Signal
    Files:
      - Path: signal.parquet
        CrossSection: 1.0
        SumOfWeights: 10000.0
  - Name: Background ZZ
    Files:
      - Path: background.parquet
        CrossSection: 1.0
        SumOfWeights: 10000.0
NormFactors:
  - Name: Signal_norm
    Samples: Signal
    Nominal: 1.0
    Bounds: [0.0, 10.0]
Systematics:
  - Name: ParticleID
    Type: NormPlusShape
    Up: { Variation: scaleFactorUP }
    Down: { Variation: scaleFactorDOWN }
  - Name: m4l_scale
    Type: NormPlusShape
    Samples: Signal
    Up: { Variation: m4lUP }
    Down: { Variation: m4lDOWN }
"#;

fn setup(dir: &Path) -> AnalysisConfig {
    write(dir, "signal.parquet", signal());
    write(dir, "background.parquet", background());
    // data is the nominal prediction plus events the selection must reject
    let mut data_a = signal();
    let mut three_leptons = event_at(127.5, [11, 11, 13, 13]);
    three_leptons.leptons.pop();
    data_a.push(three_leptons);
    let mut charged = event_at(127.5, [11, 11, 13, 13]);
    charged.leptons[0].charge = -1;
    data_a.push(charged);
    write(dir, "data_A.parquet", data_a);
    write(dir, "data_B.parquet", background());
    let config_path = dir.join("analysis.yml");
    std::fs::write(&config_path, CONFIG).unwrap();
    AnalysisConfig::from_file(&config_path).unwrap()
}

#[test]
fn test_histograms_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let (histograms, cutflow) = pipeline::histograms(&config).unwrap();

    let signal = histograms.get("Signal", Variation::Nominal).unwrap();
    assert_relative_eq!(signal.integral(), 20.0, epsilon = 1e-9);
    assert_relative_eq!(signal.sumw[9], 20.0, epsilon = 1e-9);
    assert_relative_eq!(
        histograms
            .get("Signal", Variation::ScaleFactorUp)
            .unwrap()
            .integral(),
        22.0,
        epsilon = 1e-9
    );
    let background = histograms.get("Background ZZ", Variation::Nominal).unwrap();
    assert!(background.sumw.iter().all(|w| (w - 3.0).abs() < 1e-9));
    assert_eq!(
        histograms.get("Background ZZ", Variation::M4lDown).unwrap().sumw,
        background.sumw
    );
    assert_eq!(histograms.variations("Data"), ["nominal"]);
    assert_relative_eq!(
        histograms.get("Data", Variation::Nominal).unwrap().integral(),
        122.0
    );

    let data = cutflow.get("Data").unwrap();
    assert_eq!(data.delivered.events, 123);
    assert_eq!(data.lepton_filter.events, 122);

    let saved = HistogramSet::load(dir.path().join("out/histograms.bin")).unwrap();
    assert_eq!(saved, histograms);
}

#[test]
fn test_workspace_and_fit_stages() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let (histograms, _) = pipeline::histograms(&config).unwrap();
    let workspace = pipeline::workspace(&config, &histograms).unwrap();
    let saved = Workspace::load(dir.path().join("out/workspace.json")).unwrap();
    assert_eq!(saved, workspace);

    let results = pipeline::fit(&workspace, None, None).unwrap();
    let (mu, sigma) = results.poi();
    assert_eq!(results.labels[0], "Signal_norm");
    assert_relative_eq!(mu, 1.0, epsilon = 1e-2);
    assert!(sigma > 0.0 && sigma < 1.0);

    let model = Model::from_workspace(&workspace, None).unwrap();
    let result = significance(&model).unwrap();
    assert!(result.observed.z > 1.0);
    assert_relative_eq!(result.observed.z, result.expected.z, epsilon = 1e-2);
}
