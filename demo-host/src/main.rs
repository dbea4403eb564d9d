//! Headless demo driver: opens the default output device through `cpal`,
//! compiles a one-plugin pedalboard around a sine generator, and runs it
//! through [`stompframe_core::host::AudioHostLoop`] for a fixed duration,
//! exercising the command/event rings the same way a real service layer
//! would (a live volume change partway through, VU telemetry polled and
//! acked on the main thread).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use stompframe_core::compiler::{compile, HostConfig, LoadedPlugin, PluginLoader};
use stompframe_core::handle::{leak_handle, take_handle};
use stompframe_core::host::{AudioDriver, AudioHostLoop};
use stompframe_core::pedalboard::{Pedalboard, OUTPUT_VOLUME_INSTANCE_ID};
use stompframe_core::protocol::{pop_event, push_command, Command, Event};
use stompframe_core::ringbuffer::{CommandRing, EventRing};
use stompframe_core::runtime::{VuSubscription, VuUpdate};
use stompframe_core::testing::GeneratorPlugin;
use stompframe_core::worker::HostWorkerThread;

#[derive(Parser, Debug)]
#[command(about = "Plays a demo tone through the stompframe engine")]
struct Args {
    /// Output device name; the system default is used if omitted.
    #[arg(long)]
    output_device: Option<String>,
    /// Sine generator frequency.
    #[arg(long, default_value_t = 440.0)]
    frequency_hz: f32,
    /// Starting output volume in dB.
    #[arg(long, default_value_t = -18.0)]
    gain_db: f32,
    /// How long to run before the process exits.
    #[arg(long, default_value_t = 6.0)]
    duration_secs: f32,
    /// Requested device period size, in frames.
    #[arg(long, default_value_t = 512)]
    period_size: u32,
}

struct GeneratorLoader {
    frequency_hz: f32,
}

impl PluginLoader for GeneratorLoader {
    fn instantiate(&self, _uri: &str, sample_rate: f32) -> Result<LoadedPlugin, String> {
        Ok(LoadedPlugin { runtime: Box::new(GeneratorPlugin::new(self.frequency_hz, sample_rate)), worker_task: None })
    }
}

/// Reports sample rate and channel counts straight from the opened `cpal`
/// stream; xrun and CPU-use counters are filled in from the stream's own
/// error callback and block timings since `cpal` exposes neither directly.
struct CpalDriver {
    sample_rate: f32,
    output_channels: usize,
    xruns: Arc<AtomicU64>,
}

impl AudioDriver for CpalDriver {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
    fn input_channel_count(&self) -> usize {
        0
    }
    fn output_channel_count(&self) -> usize {
        self.output_channels
    }
    fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }
    fn cpu_use(&self) -> f32 {
        0.0
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let host = cpal::default_host();
    let device = match &args.output_device {
        Some(name) => host
            .output_devices()
            .context("no audio output devices available")?
            .find(|d| d.name().as_deref().map(|n| n == name).unwrap_or(false))
            .with_context(|| format!("no output device named '{name}'"))?,
        None => host.default_output_device().context("no default output device available")?,
    };
    log::info!("using output device: {}", device.name().unwrap_or_else(|_| "<unknown>".to_string()));

    let supported = device.default_output_config()?;
    let sample_rate = supported.sample_rate() as f32;
    let channels = supported.channels() as usize;
    let mut stream_config: cpal::StreamConfig = supported.into();
    stream_config.buffer_size = cpal::BufferSize::Fixed(args.period_size);

    let config = HostConfig { sample_rate, ..HostConfig::default() };
    let mut pedalboard = Pedalboard::new("demo tone");
    pedalboard.output_volume_db = args.gain_db;
    pedalboard.push_plugin("urn:stompframe:demo:generator", Vec::new());

    let worker = HostWorkerThread::start(config.worker_request_ring_capacity);
    let loader = GeneratorLoader { frequency_hz: args.frequency_hz };
    let runtime = compile(&pedalboard, &loader, &worker, &config, 0, channels, None)?;

    let commands_in = Arc::new(CommandRing::new(config.command_ring_capacity, config.lock_memory));
    let events_out = Arc::new(EventRing::new(config.event_ring_capacity, config.lock_memory));
    let xruns = Arc::new(AtomicU64::new(0));

    let driver = CpalDriver { sample_rate, output_channels: channels, xruns: xruns.clone() };
    let mut audio_host = AudioHostLoop::new(driver, commands_in.clone(), events_out.clone());
    audio_host.install_initial_pedalboard(runtime);
    audio_host.activate();

    let max_block_size = config.max_block_size;
    let mut scratch: Vec<Vec<f32>> = (0..channels).map(|_| vec![0.0f32; max_block_size]).collect();

    let err_xruns = xruns.clone();
    let err_fn = move |err: cpal::StreamError| {
        let text = err.to_string();
        if text.contains("underrun") || text.contains("overrun") {
            err_xruns.fetch_add(1, Ordering::Relaxed);
        } else {
            log::error!("stream error: {text}");
        }
    };

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = (data.len() / channels).min(max_block_size);
            if frames == 0 {
                return;
            }
            {
                let mut driver_out: Vec<&mut [f32]> = scratch.iter_mut().map(|ch| &mut ch[..frames]).collect();
                audio_host.process_block(&[], &mut driver_out, frames, &[]);
            }
            for i in 0..frames {
                for (ch, buf) in scratch.iter().enumerate() {
                    data[i * channels + ch] = buf[i];
                }
            }
            for sample in &mut data[frames * channels..] {
                *sample = 0.0;
            }
        },
        err_fn,
        None,
    )?;
    stream.play()?;

    let vu_config = leak_handle(vec![VuSubscription { instance_id: OUTPUT_VOLUME_INSTANCE_ID }]);
    push_command(&commands_in, &Command::SetVuSubscriptions { config_handle: vu_config });

    let half_point = Duration::from_secs_f32(args.duration_secs / 2.0);
    let total = Duration::from_secs_f32(args.duration_secs);
    let poll_interval = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    let mut dipped = false;

    while elapsed < total {
        std::thread::sleep(poll_interval);
        elapsed += poll_interval;

        if !dipped && elapsed >= half_point {
            log::info!("dipping output volume by 6 dB for the remainder of the run");
            push_command(&commands_in, &Command::SetOutputVolume { db: args.gain_db - 6.0 });
            dipped = true;
        }

        while let Some(event) = pop_event(&events_out) {
            match event {
                Event::SendVuUpdate { snapshot_handle } => {
                    let updates: Vec<VuUpdate> = unsafe { take_handle(snapshot_handle) };
                    if let Some(update) = updates.first() {
                        let peak = update.output_max.iter().cloned().fold(0.0f32, f32::max);
                        log::info!("output peak: {peak:.3}");
                    }
                    push_command(&commands_in, &Command::AckVuUpdate);
                }
                Event::Underrun { count } => log::warn!("{count} underrun(s) reported"),
                _ => {}
            }
        }
    }

    drop(stream);
    worker.shutdown();
    Ok(())
}
