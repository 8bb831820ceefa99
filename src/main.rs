use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use open_radio::{
    audio::{registry::SessionRegistry, voice::SongbirdTransport},
    bot::OpenRadioBot,
    cache::ResolutionCache,
    config::Config,
    engine::RadioEngine,
    sources::{ytdlp::YtDlp, DirectUrlClient, MusicSource, SearchClient, SpotifyClient, TrackResolver},
    storage::JsonStorage,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_radio=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    if std::env::args().any(|arg| arg == "--health-check") {
        return tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(health_check());
    }

    info!("📻 Starting Open Radio v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("open-radio")
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    let background = CancellationToken::new();
    let cache = Arc::new(ResolutionCache::new(config.cache_ttl));
    let sweeper = cache.spawn_sweeper(config.cache_sweep_interval, background.clone());

    let ytdlp = Arc::new(YtDlp::new());
    match ytdlp.version().await {
        Ok(version) => info!("🎬 yt-dlp {}", version),
        Err(e) => warn!("⚠️ yt-dlp is not usable, searches will fail: {}", e),
    }

    let search: Arc<dyn MusicSource> = Arc::new(SearchClient::new(ytdlp.clone(), config.search_engine));
    let mut resolver = TrackResolver::new(search, cache.clone(), config.resolver_settings())
        .with_source(Arc::new(DirectUrlClient::new(ytdlp, config.max_playlist_size)));
    if let (Some(id), Some(secret)) = (&config.spotify_client_id, &config.spotify_client_secret) {
        info!("🟢 Spotify links enabled");
        resolver = resolver.with_source(Arc::new(SpotifyClient::new(
            id.clone(),
            secret.clone(),
            config.max_playlist_size,
        )));
    }

    let songbird = Songbird::serenity();
    let (voice_tx, voice_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(SongbirdTransport::new(songbird.clone(), voice_tx));

    let registry = SessionRegistry::init(
        Arc::new(resolver),
        transport,
        storage.clone(),
        config.session_settings(),
        voice_rx,
    );
    let engine = RadioEngine::new(registry);

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let handler = OpenRadioBot::new(Arc::new(config.clone()), engine.clone(), storage);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Sessions save their final snapshot before the gateway goes away.
    let shards = client.shard_manager.clone();
    let draining = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Couldn't listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, saving sessions...");
        draining.shutdown().await;
        shards.shutdown_all().await;
    });

    info!("🚀 Connecting to Discord");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    background.cancel();
    let _ = sweeper.await;
    info!("📊 Resolution cache at exit: {}", cache.metrics());
    info!("👋 Bye");
    Ok(())
}

async fn health_check() -> Result<()> {
    let yt_dlp = YtDlp::new().version().await;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    match yt_dlp {
        Ok(_) if ffmpeg.status.success() => {
            println!("OK");
            Ok(())
        }
        Ok(_) => anyhow::bail!("ffmpeg is missing"),
        Err(e) => anyhow::bail!("yt-dlp is missing: {}", e),
    }
}
