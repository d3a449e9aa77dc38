mod gadgetpatch;

use gadgetpatch::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv = Cli::parse();
    let mp = Arc::new(progress::GLOBAL_MP.clone());

    tracing_subscriber::fmt()
        .with_max_level(argv.log_level())
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(move || MultiProgressWriter::new(mp.clone()))
        .init();

    program::program(argv).await
}
