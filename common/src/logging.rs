use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn level_for(output: &crate::config::OutputConfig) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    if output.quiet {
        return LevelFilter::OFF;
    }
    match output.verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured verbosity when it is set. Calling this more than
/// once is an error since only one global subscriber may exist.
pub fn init_tracing(output: &crate::config::OutputConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::default().add_directive(level_for(output).into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn verbosity_maps_to_levels() {
        let levels: Vec<_> = (0..5)
            .map(|verbose| {
                level_for(&OutputConfig {
                    quiet: false,
                    verbose,
                })
            })
            .collect();
        assert_eq!(
            levels,
            vec![
                LevelFilter::ERROR,
                LevelFilter::INFO,
                LevelFilter::DEBUG,
                LevelFilter::TRACE,
                LevelFilter::TRACE
            ]
        );
    }

    #[test]
    fn quiet_wins_over_verbose() {
        let output = OutputConfig {
            quiet: true,
            verbose: 3,
        };
        assert_eq!(level_for(&output), LevelFilter::OFF);
    }
}
