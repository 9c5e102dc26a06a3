#[cfg(not(feature = "streaming"))]
fn main() {
    eprintln!(
        "The avsync demo requires the \"streaming\" feature. Rebuild with `--features streaming` to enable playback."
    );
}

#[cfg(feature = "streaming")]
mod cli {
    use std::env;
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{bail, Context, Result};
    use avsync::{
        AudioContext, AudioDevice, Channels, FrameInfo, SyncConfig, SyncSource, VideoStandard,
    };

    /// Genesis NTSC master clock
    const MASTER_CLOCK_HZ: u64 = 53_693_175;
    /// SN76489 PSG: one sample every 15 * 16 master clocks
    const PSG_DIVIDER: u64 = 15 * 16;
    const TONE_HZ: f64 = 440.0;
    const TONE_LEVEL: i16 = 6000;

    struct Options {
        config_path: Option<String>,
        sync: Option<SyncSource>,
        display_hz: u32,
        pal: bool,
        seconds: f64,
    }

    fn print_usage() {
        println!("Usage: avsync [--config FILE] [--sync audio|video] [--display-hz N] [--pal] [--seconds N]");
    }

    fn parse_args() -> Result<Option<Options>> {
        let mut options = Options {
            config_path: None,
            sync: None,
            display_hz: 60,
            pal: false,
            seconds: 5.0,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("{name} expects a value"))
            };
            match arg.as_str() {
                "--config" => options.config_path = Some(value("--config")?),
                "--sync" => {
                    options.sync = Some(match value("--sync")?.as_str() {
                        "audio" => SyncSource::Audio,
                        "video" => SyncSource::Video,
                        other => bail!("unknown sync source '{other}' (expected audio or video)"),
                    })
                }
                "--display-hz" => {
                    options.display_hz = value("--display-hz")?
                        .parse()
                        .context("--display-hz expects an integer")?
                }
                "--seconds" => {
                    options.seconds = value("--seconds")?
                        .parse()
                        .context("--seconds expects a number")?
                }
                "--pal" => options.pal = true,
                "-h" | "--help" => {
                    print_usage();
                    return Ok(None);
                }
                other => bail!("unknown argument '{other}'"),
            }
        }
        Ok(Some(options))
    }

    pub fn run() -> Result<()> {
        env_logger::init();
        let Some(options) = parse_args()? else {
            return Ok(());
        };

        let mut config = match &options.config_path {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("loading configuration from {path}"))?,
            None => SyncConfig::default(),
        };
        if let Some(sync) = options.sync {
            config.sync_source = sync;
        }

        let mut ctx = AudioContext::new(&config, AudioDevice::negotiate(&config), options.display_hz)?;
        if options.pal {
            ctx.set_video_standard(VideoStandard::Pal);
        }
        let device = AudioDevice::open(ctx.mixer()).context("opening audio output")?;
        let mut psg = ctx
            .create_source(MASTER_CLOCK_HZ, PSG_DIVIDER, Channels::Mono)
            .context("registering the PSG source")?;

        let source_hz = ctx.video_standard().source_hz();
        let native_rate = MASTER_CLOCK_HZ as f64 / PSG_DIVIDER as f64;
        let samples_per_frame = native_rate / source_hz as f64;
        let half_period = native_rate / TONE_HZ / 2.0;
        let total_frames = (options.seconds * source_hz as f64).round() as u64;
        let locked = config.sync_to_audio();
        let refresh = Duration::from_secs_f64(1.0 / options.display_hz.max(1) as f64);

        println!(
            "Syncing to {:?}: {} Hz source on a {} Hz display, {} frames buffered target",
            config.sync_source,
            source_hz,
            options.display_hz,
            ctx.min_buffered()
        );

        let start = Instant::now();
        let mut next_vsync = start;
        let mut presentations = 0u64;
        let mut skipped = 0u64;
        let mut carry = 0.0f64;
        let mut phase = 0.0f64;
        let mut level = TONE_LEVEL;

        for _ in 0..total_frames {
            carry += samples_per_frame;
            let count = carry as u64;
            carry -= count as f64;
            for _ in 0..count {
                psg.put_mono_sample(level);
                phase += 1.0;
                if phase >= half_period {
                    phase -= half_period;
                    level = -level;
                }
            }

            let outcome = ctx.frame_complete(FrameInfo::progressive(320), &mut || {
                // audio paces locked mode; otherwise wait for the simulated vsync
                if locked {
                    return;
                }
                next_vsync += refresh;
                let now = Instant::now();
                if next_vsync > now {
                    thread::sleep(next_vsync - now);
                } else {
                    next_vsync = now;
                }
            });
            presentations += outcome.presentations as u64;
            if outcome.presentations == 0 {
                skipped += 1;
            }
        }

        let elapsed = start.elapsed();
        let source_stats = psg.stats();
        let drift = ctx.drift_stats();
        ctx.shutdown();
        drop(device);
        drop(psg);

        println!("\n=== Sync Statistics ===");
        println!("Duration:          {:.2} seconds", elapsed.as_secs_f32());
        println!("Video frames:      {total_frames}");
        println!("Presentations:     {presentations} ({skipped} frames dropped)");
        println!("Samples in:        {}", source_stats.samples_in);
        println!("Frames out:        {}", source_stats.frames_out);
        println!("Handoffs:          {}", source_stats.handoffs);
        println!("Drift corrections: {}", drift.corrections);
        println!("Underruns:         {}", drift.underruns);
        Ok(())
    }
}

#[cfg(feature = "streaming")]
fn main() -> anyhow::Result<()> {
    cli::run()
}
