use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use blockgate::metrics::Counters;
use blockgate::{config, Dispatcher, Level, Network, Registry, Services};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::load(path.as_deref())?;

    let counters = Arc::new(Counters::new());
    let services = Arc::new(Services::new(config, Arc::new(Level::new()), counters.clone()));
    services.start();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&services),
        Registry::with_builtin_commands(),
    ));

    let mut network = Network::bind(
        &services.config.server,
        Arc::clone(&dispatcher),
        tokio::runtime::Handle::current(),
    )?;
    let waker = network.waker();
    let stop = CancellationToken::new();
    let mut serve = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || network.run(&stop)
    });

    let interrupted = tokio::select! {
        // the network only returns on its own when polling breaks
        result = &mut serve => {
            result??;
            false
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            true
        }
    };
    dispatcher.close();
    if interrupted {
        log::info!("interrupted");
        stop.cancel();
        waker.wake();
        serve.await??;
    }

    services.shutdown().await;
    for (name, value) in counters.snapshot() {
        log::info!("{name}: {value}");
    }
    Ok(())
}
