//! Example demonstrating the configuration and preset management system
//!
//! Run with: cargo run --package cadenza-core --example config_demo

use cadenza_core::domain::{CadenzaConfig, ConfigManager, EffectParams, EffectsChain, PresetManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("cadenza_core=debug,info")
        .init();

    let workspace = tempfile::tempdir()?;
    println!("=== Cadenza Configuration Demo ===\n");

    // 1. Factory defaults
    let config = CadenzaConfig::factory_default();
    println!(
        "1. Factory defaults: history {} snapshots, export {}, ffmpeg at {}",
        config.app.history_limit,
        config.app.default_export_format,
        config.tools.ffmpeg_path.display()
    );

    // 2. Save and reload through the manager
    let manager = ConfigManager::new(workspace.path().to_path_buf());
    manager.save(&config).await?;
    let reloaded = manager.load().await;
    println!(
        "2. Reloaded {} (echo delay {} ms)",
        manager.config_path().display(),
        reloaded.effects.echo_delay_ms
    );

    // 3. A broken file falls back to defaults and is kept aside
    tokio::fs::write(manager.config_path(), "app = [broken").await?;
    let recovered = manager.load().await;
    println!(
        "3. Recovered from corrupt file, preview chunk {} frames",
        recovered.app.preview_chunk_frames
    );

    // 4. Presets
    let presets = PresetManager::new(workspace.path().join(&config.app.preset_dir));
    let warm = EffectParams::neutral()
        .with_eq(4.0, 0.0, -2.0)
        .toggled_reverb();
    presets.save_preset("warm", &warm).await?;
    presets
        .save_preset("chipmunk", &EffectParams::neutral().with_pitch(7.0))
        .await?;
    println!("4. Presets: {:?}", presets.list_presets().await?);

    // 5. What a preset renders to
    let loaded = presets.load_preset("warm").await?;
    let chain = EffectsChain::from_params(&loaded, &config.effects);
    let stages: Vec<&str> = chain.stages().iter().map(|s| s.name()).collect();
    println!("5. 'warm' renders through {:?}", stages);

    presets.delete_preset("chipmunk").await?;
    println!("\n✓ Done, remaining presets: {:?}", presets.list_presets().await?);
    Ok(())
}
