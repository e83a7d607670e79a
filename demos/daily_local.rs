use {
    rotatefile::{ManualScheduler, RotateFileBuilder, TimeZone},
    std::{io::Write, sync::Arc},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    // Rotate on demand here; without `.scheduler(..)` the writer would rotate
    // every midnight on the shared scheduler thread.
    let trigger = Arc::new(ManualScheduler::new());
    let mut logger = RotateFileBuilder::new("./logs/daily.log")
        .rotate(7) // Keep one week of archives
        .time_zone(TimeZone::Local)
        .scheduler(trigger.clone())
        .build();

    writeln!(logger, "System startup")?;
    writeln!(logger, "Configuration loaded successfully")?;

    // Archives today's content as ./logs/daily.log.<yesterday>
    trigger.fire();

    writeln!(logger, "Server listening on port 8080")?;
    logger.close()?;

    Ok(())
}
