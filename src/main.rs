use advex_rs::config::AttackConfig;
use advex_rs::dataset::LabeledDataset;
use advex_rs::emit::ImageEmitter;
use advex_rs::error::AttackError;
use advex_rs::model::load_model;
use advex_rs::runner::BatchRunner;
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::env;
use std::path::Path;
use std::process;

fn init_logging() {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {l} {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .unwrap();
    log4rs::init_config(config).unwrap();
}

fn run(config_path: &Path) -> Result<(), AttackError> {
    let config = AttackConfig::from_file(config_path)?;
    info!(
        "method {}, epsilon {}, {} primary iterations",
        config.method, config.epsilon, config.niters
    );

    let net = load_model(config.arch()?, &config.model_path)?;
    let dataset = LabeledDataset::open(&config.index_path, &config.data_dir)?;
    let emitter = ImageEmitter::create(&config.save_dir)?;

    let runner = BatchRunner::new(&config, &net)?;
    let written = runner.run(&dataset, &emitter)?;
    info!("{} images saved to {}", written, config.save_dir.display());
    Ok(())
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: advex-rs <config.json>");
            process::exit(2);
        }
    };
    if let Err(err) = run(Path::new(&config_path)) {
        error!("{}", err);
        process::exit(1);
    }
}
