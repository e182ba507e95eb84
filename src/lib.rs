pub mod error;
pub mod loaders;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::{Error, Result};
pub use trainers::{launch, load_config, RunConfig, RunSummary};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger; `RUST_LOG` overrides the default `info` level.
    /// Calling it twice is harmless.
    pub fn init_logger() {
        let _ = Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    }
}
