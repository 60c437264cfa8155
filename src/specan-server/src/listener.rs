// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! TCP command/status listener.
//!
//! One connection per client. Client to server: newline-delimited JSON
//! commands. Server to client: binary frames (spectrum and sweep packets,
//! plus JSON messages for status, errors, and signal events wrapped in a
//! frame of their own message type), all on one self-delimiting stream.
//!
//! Malformed JSON gets an error frame and the session continues; unknown
//! commands are ignored with a warning.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use specan_backend::{probe_devices, SampleSource};
use specan_dsp::{AveragingMode, DspParam, WindowType};
use specan_protocol::{
    encode_json_frame, parse_command, ClientCommand, ParsedCommand, ServerMessage,
};

use crate::signals::SignalQuery;
use crate::stream::StreamManager;
use crate::sweep::{SweepEngine, SweepMode, SweepParams};

pub struct AppState {
    pub config: Arc<crate::config::ServerConfig>,
    pub manager: Arc<StreamManager>,
    pub sweep: Arc<SweepEngine>,
    pub store: Arc<crate::signals::SignalStore>,
}

/// Accept client connections until shutdown is signalled.
pub async fn run_listener(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let (socket, peer) = accept?;
                info!("Client connected: {}", peer);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, peer, state).await {
                        error!("Client {} error: {:?}", peer, e);
                    }
                });
            }
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) if *shutdown_rx.borrow() => {
                        info!("Listener shutting down");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => break,
                }
            }
        }
    }
    Ok(())
}

async fn handle_client(
    socket: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let (client_id, reply_tx, mut out_rx) = state.manager.add_client().await;

    // Writer task: everything for this client funnels through its queue.
    let write_task = tokio::spawn(async move {
        while let Some(buf) = out_rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    // Initial full status so the client can render immediately.
    reply(
        &reply_tx,
        &ServerMessage::status(build_full_status(&state).await),
    );

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                handle_line(trimmed, &state, &reply_tx).await;
            }
            Ok(None) => {
                info!("Client {} disconnected", peer);
                break;
            }
            Err(e) => {
                info!("Client {} read error: {}", peer, e);
                break;
            }
        }
    }

    state.manager.remove_client(client_id).await;
    write_task.abort();
    Ok(())
}

async fn handle_line(line: &str, state: &Arc<AppState>, tx: &mpsc::Sender<Bytes>) {
    match parse_command(line) {
        Ok(ParsedCommand::Known(cmd)) => dispatch(cmd, state, tx).await,
        Ok(ParsedCommand::Unknown(cmd)) => {
            warn!("Unknown command: {}", cmd);
        }
        Err(e) => {
            warn!("Invalid command JSON: {}", e);
            reply(tx, &ServerMessage::error(format!("Invalid JSON: {}", e)));
        }
    }
}

async fn dispatch(cmd: ClientCommand, state: &Arc<AppState>, tx: &mpsc::Sender<Bytes>) {
    let manager = &state.manager;
    match cmd {
        ClientCommand::Start => match manager.start_live().await {
            Ok(()) => {
                let mut status = build_full_status(state).await;
                status["streaming"] = json!(true);
                reply(tx, &ServerMessage::status(status));
            }
            Err(e) => reply(tx, &ServerMessage::error(e.to_string())),
        },
        ClientCommand::Stop => {
            manager.stop_live().await;
            let mut status = build_full_status(state).await;
            status["streaming"] = json!(false);
            reply(tx, &ServerMessage::status(status));
        }

        ClientCommand::SetFrequency { value } => {
            let ok = manager.receiver().set_frequency(value);
            reply(tx, &ServerMessage::status(json!({"center_freq": value, "ok": ok})));
        }
        ClientCommand::SetGain { value } => {
            let ok = manager.receiver().set_gain(value);
            reply(tx, &ServerMessage::status(json!({"gain": value, "ok": ok})));
        }
        ClientCommand::SetSampleRate { value } => {
            let ok = manager.receiver().set_sample_rate(value);
            reply(tx, &ServerMessage::status(json!({"sample_rate": value, "ok": ok})));
        }
        ClientCommand::SetBandwidth { value } => {
            let ok = manager.receiver().set_bandwidth(value);
            reply(tx, &ServerMessage::status(json!({"bandwidth": value, "ok": ok})));
        }

        ClientCommand::SetFftSize { value } => match manager.set_fft_size(value as usize).await {
            Ok(()) => reply(tx, &ServerMessage::status(json!({"fft_size": value, "ok": true}))),
            Err(e) => reply(tx, &ServerMessage::error(e)),
        },

        ClientCommand::SetDsp { params } => {
            let dsp = manager.dsp_pipeline();
            for (key, value) in &params {
                match dsp_param(key, value) {
                    Some(param) => dsp.apply(param),
                    None => warn!("Ignoring DSP parameter {}={}", key, value),
                }
            }
            reply(tx, &ServerMessage::status(json!({"dsp_updated": true})));
        }

        ClientCommand::SetAgc {
            enabled,
            target_dbfs,
            hysteresis,
            gain_step,
            min_interval,
        } => {
            let agc = &manager.agc;
            if let Some(enabled) = enabled {
                agc.set_enabled(enabled);
            }
            if let Some(v) = target_dbfs {
                agc.set_target_dbfs(v);
            }
            if let Some(v) = hysteresis {
                agc.set_hysteresis(v);
            }
            if let Some(v) = gain_step {
                agc.set_gain_step(v);
            }
            if let Some(v) = min_interval {
                agc.set_min_interval(v);
            }
            reply(
                tx,
                &ServerMessage::status(json!({"agc_enabled": agc.enabled(), "ok": true})),
            );
        }

        ClientCommand::GetStatus => {
            reply(tx, &ServerMessage::status(build_full_status(state).await));
        }

        ClientCommand::CheckDevice => {
            let result = probe_devices();
            reply(
                tx,
                &ServerMessage::status(json!({
                    "device_connected": result.available,
                    "device_info": result.devices.first(),
                    "device_error": result.error,
                })),
            );
        }

        // --- Sweep commands ---
        ClientCommand::SweepStart {
            mode,
            freq_start,
            freq_end,
            fft_size,
            sample_rate,
            averages,
            settle_chunks,
            display_bins,
        } => {
            let defaults = &state.config.sweep;
            let mode = match mode.as_deref().unwrap_or("survey") {
                "survey" => SweepMode::Survey,
                "band_monitor" => SweepMode::BandMonitor,
                other => {
                    reply(tx, &ServerMessage::error(format!("unknown sweep mode: {}", other)));
                    return;
                }
            };
            if freq_start >= freq_end {
                reply(tx, &ServerMessage::error("freq_start must be less than freq_end"));
                return;
            }
            let fft_size = fft_size.unwrap_or(defaults.fft_size as u32) as usize;
            if fft_size == 0 || !fft_size.is_power_of_two() {
                reply(tx, &ServerMessage::error("fft_size must be a positive power of 2"));
                return;
            }
            let sample_rate = sample_rate.unwrap_or(defaults.sample_rate);
            if sample_rate <= 0.0 {
                reply(tx, &ServerMessage::error("sample_rate must be positive"));
                return;
            }
            let averages = averages.unwrap_or(defaults.averages_per_step);
            if averages == 0 {
                reply(tx, &ServerMessage::error("averages must be positive"));
                return;
            }

            let params = SweepParams {
                mode,
                freq_start,
                freq_end,
                fft_size,
                sample_rate,
                usable_fraction: defaults.usable_fraction,
                settle_chunks: settle_chunks.unwrap_or(defaults.settle_chunks),
                averages_per_step: averages,
                display_bins: display_bins.unwrap_or(defaults.display_bins as u32) as usize,
            };
            match state.sweep.start(params).await {
                Ok(()) => {
                    let mut status = serde_json::to_value(state.sweep.status())
                        .unwrap_or_else(|_| json!({}));
                    status["ok"] = json!(true);
                    reply(tx, &ServerMessage::status(status));
                }
                Err(e) => reply(tx, &ServerMessage::error(e.to_string())),
            }
        }
        ClientCommand::SweepStop => {
            state.sweep.stop().await;
            reply_sweep_status(state, tx);
        }
        ClientCommand::SweepStatus => reply_sweep_status(state, tx),

        // --- Detection commands ---
        ClientCommand::DetectionEnable { enabled } => {
            let flushed = manager.detector.set_enabled(enabled.unwrap_or(true));
            manager.forward_events(flushed);
            reply(
                tx,
                &ServerMessage::status(
                    serde_json::to_value(manager.detector.status()).unwrap_or_else(|_| json!({})),
                ),
            );
        }
        ClientCommand::DetectionSet { params } => {
            for (key, value) in &params {
                apply_detection_param(state, key, value);
            }
            reply(
                tx,
                &ServerMessage::status(
                    serde_json::to_value(manager.detector.status()).unwrap_or_else(|_| json!({})),
                ),
            );
        }
        ClientCommand::DetectionStatus => {
            let mut status =
                serde_json::to_value(manager.detector.status()).unwrap_or_else(|_| json!({}));
            let signals: Vec<Value> = manager
                .detector
                .tracked()
                .iter()
                .map(|s| {
                    json!({
                        "signal_id": s.id,
                        "center_freq": s.center_freq,
                        "peak_freq": s.peak_freq,
                        "bandwidth": s.bandwidth,
                        "peak_power": s.peak_power,
                        "avg_power": s.avg_power,
                        "hit_count": s.hit_count,
                        "classification": s.classification,
                    })
                })
                .collect();
            status["signals"] = json!(signals);
            reply(tx, &ServerMessage::status(status));
        }

        // --- Signal store commands ---
        ClientCommand::SignalList {
            active_only,
            limit,
            offset,
            freq_min,
            freq_max,
        } => {
            let rows = state.store.get_signals(&SignalQuery {
                active_only: active_only.unwrap_or(false),
                limit: limit.unwrap_or(100),
                offset: offset.unwrap_or(0),
                freq_min,
                freq_max,
            });
            reply(tx, &ServerMessage::status(json!({"signal_list": rows})));
        }
        ClientCommand::SignalClassify {
            signal_id,
            classification,
            notes,
        } => {
            let ok = state.store.classify_signal(
                signal_id,
                classification.as_deref().unwrap_or(""),
                notes.as_deref().unwrap_or(""),
            );
            reply(tx, &ServerMessage::status(json!({"ok": ok})));
        }
        ClientCommand::SignalDelete { signal_id } => {
            let ok = state.store.delete_signal(signal_id);
            reply(tx, &ServerMessage::status(json!({"ok": ok})));
        }
        ClientCommand::SignalDbStats => {
            reply(tx, &ServerMessage::status(state.store.get_stats()));
        }

        // --- Recording commands ---
        ClientCommand::RecIqStart => {
            let status = manager.receiver().status();
            let fft_size = manager.dsp_pipeline().fft_size() as u32;
            match manager.recording.iq.start(&status, fft_size) {
                Ok(filename) => reply(
                    tx,
                    &ServerMessage::status(
                        json!({"ok": true, "iq_recording": true, "iq_filename": filename}),
                    ),
                ),
                Err(e) => reply(tx, &ServerMessage::error(e.to_string())),
            }
        }
        ClientCommand::RecIqStop => {
            let filename = manager.recording.iq.stop();
            reply(
                tx,
                &ServerMessage::status(
                    json!({"ok": true, "iq_recording": false, "iq_filename": filename}),
                ),
            );
        }
        ClientCommand::RecSpectrumStart => {
            let status = manager.receiver().status();
            let fft_size = manager.dsp_pipeline().fft_size() as u32;
            match manager.recording.spectrum.start(&status, fft_size) {
                Ok(filename) => reply(
                    tx,
                    &ServerMessage::status(json!({
                        "ok": true, "spectrum_recording": true, "spectrum_filename": filename,
                    })),
                ),
                Err(e) => reply(tx, &ServerMessage::error(e.to_string())),
            }
        }
        ClientCommand::RecSpectrumStop => {
            let filename = manager.recording.spectrum.stop();
            reply(
                tx,
                &ServerMessage::status(json!({
                    "ok": true, "spectrum_recording": false, "spectrum_filename": filename,
                })),
            );
        }
        ClientCommand::RecList => {
            reply(
                tx,
                &ServerMessage::status(json!({
                    "recordings": manager.recording.list_recordings(),
                    "storage": manager.recording.storage_info(),
                })),
            );
        }
        ClientCommand::RecDelete { filename } => {
            let ok = manager.recording.delete_recording(&filename);
            reply(tx, &ServerMessage::status(json!({"ok": ok})));
        }
        ClientCommand::RecStatus => {
            reply(tx, &ServerMessage::status(manager.recording.status()));
        }

        // --- Playback commands ---
        ClientCommand::PlaybackStart { filename } => {
            // Leaving sweep mode first keeps the three modes exclusive.
            if state.sweep.is_running() {
                state.sweep.stop().await;
            }
            match manager.start_playback(&filename).await {
                Ok(_) => {
                    let mut status = manager.recording.playback.status_json();
                    status["ok"] = json!(true);
                    reply(tx, &ServerMessage::status(status));
                }
                Err(e) => reply(tx, &ServerMessage::error(e.to_string())),
            }
        }
        ClientCommand::PlaybackStop => {
            manager.stop_playback().await;
            reply(
                tx,
                &ServerMessage::status(json!({"ok": true, "playback_active": false})),
            );
        }
        ClientCommand::PlaybackPause => {
            manager.recording.playback.pause();
            reply(tx, &ServerMessage::status(manager.recording.playback.status_json()));
        }
        ClientCommand::PlaybackResume => {
            manager.recording.playback.resume();
            reply(tx, &ServerMessage::status(manager.recording.playback.status_json()));
        }
        ClientCommand::PlaybackSpeed { value } => {
            manager.recording.playback.set_speed(value);
            reply(tx, &ServerMessage::status(manager.recording.playback.status_json()));
        }
        ClientCommand::PlaybackLoop { enabled } => {
            manager.recording.playback.set_loop(enabled.unwrap_or(true));
            reply(tx, &ServerMessage::status(manager.recording.playback.status_json()));
        }
        ClientCommand::PlaybackSeek { position } => {
            manager.recording.playback.seek(position);
            reply(tx, &ServerMessage::status(manager.recording.playback.status_json()));
        }
    }
}

fn reply_sweep_status(state: &Arc<AppState>, tx: &mpsc::Sender<Bytes>) {
    let status = serde_json::to_value(state.sweep.status()).unwrap_or_else(|_| json!({}));
    reply(tx, &ServerMessage::status(status));
}

/// Translate a `set_dsp` key/value pair into a typed pipeline update.
fn dsp_param(key: &str, value: &Value) -> Option<DspParam> {
    match key {
        "window_type" => value
            .as_str()
            .and_then(|s| s.parse::<WindowType>().ok())
            .map(DspParam::Window),
        "averaging_mode" => value
            .as_str()
            .and_then(|s| s.parse::<AveragingMode>().ok())
            .map(DspParam::AveragingMode),
        "averaging_count" => value
            .as_u64()
            .map(|n| DspParam::AveragingCount(n as usize)),
        "averaging_alpha" => value
            .as_f64()
            .map(|a| DspParam::AveragingAlpha(a as f32)),
        "dc_removal" => value.as_bool().map(DspParam::DcRemoval),
        "peak_hold" => value.as_bool().map(DspParam::PeakHold),
        "peak_hold_decay" => value
            .as_f64()
            .map(|d| DspParam::PeakHoldDecay(d as f32)),
        "peak_hold_reset" => Some(DspParam::ResetPeakHold),
        _ => None,
    }
}

fn apply_detection_param(state: &Arc<AppState>, key: &str, value: &Value) {
    let detector = &state.manager.detector;
    match key {
        "threshold_db" => {
            if let Some(v) = value.as_f64() {
                detector.set_threshold_db(v as f32);
            }
        }
        "min_bandwidth_bins" => {
            if let Some(v) = value.as_u64() {
                detector.set_min_bandwidth_bins(v as usize);
            }
        }
        "merge_gap_bins" => {
            if let Some(v) = value.as_u64() {
                detector.set_merge_gap_bins(v as usize);
            }
        }
        "update_interval" => {
            if let Some(v) = value.as_f64() {
                detector.set_update_interval(v);
            }
        }
        "persistence_timeout" => {
            if let Some(v) = value.as_f64() {
                detector.set_persistence_timeout(v);
            }
        }
        "overlap_match_ratio" => {
            if let Some(v) = value.as_f64() {
                detector.set_overlap_match_ratio(v);
            }
        }
        "max_tracked_signals" => {
            if let Some(v) = value.as_u64() {
                detector.set_max_tracked_signals(v as usize);
            }
        }
        "enabled" => {
            if let Some(v) = value.as_bool() {
                let flushed = detector.set_enabled(v);
                state.manager.forward_events(flushed);
            }
        }
        _ => warn!("Ignoring detection parameter {}={}", key, value),
    }
}

/// Complete status snapshot: source parameters, mode flags, DSP, AGC,
/// sweep, detection, and recording state.
pub async fn build_full_status(state: &Arc<AppState>) -> Value {
    let manager = &state.manager;
    let source = manager.source_status();

    let mut status = Map::new();
    status.insert("center_freq".into(), json!(source.center_freq));
    status.insert("sample_rate".into(), json!(source.sample_rate));
    status.insert("bandwidth".into(), json!(source.bandwidth));
    status.insert("gain".into(), json!(source.gain));
    status.insert("running".into(), json!(source.running));
    status.insert("streaming".into(), json!(manager.is_streaming()));
    status.insert("playback_mode".into(), json!(manager.is_playback()));
    status.insert(
        "mode".into(),
        json!(manager.current_mode().await.as_str()),
    );
    status.insert(
        "fft_size".into(),
        json!(manager.dsp_pipeline().fft_size()),
    );

    merge_into(&mut status, serde_json::to_value(manager.dsp_pipeline().params()).ok());
    status.insert("agc_enabled".into(), json!(manager.agc.enabled()));
    merge_into(&mut status, serde_json::to_value(state.sweep.status()).ok());
    merge_into(&mut status, serde_json::to_value(manager.detector.status()).ok());
    merge_into(&mut status, Some(manager.recording.status()));

    Value::Object(status)
}

fn merge_into(into: &mut Map<String, Value>, from: Option<Value>) {
    if let Some(Value::Object(map)) = from {
        into.extend(map);
    }
}

fn reply(tx: &mpsc::Sender<Bytes>, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_vec(msg) {
        let _ = tx.try_send(encode_json_frame(&json));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use specan_backend::{DriverFactory, MockDriver, Receiver};
    use specan_core::{DeviceLimits, DeviceStatus};
    use specan_dsp::{SignalDetector, SoftwareAgc};
    use specan_protocol::{FrameHeader, MSG_JSON, MSG_SPECTRUM};

    use crate::config::ServerConfig;
    use crate::recording::RecordingManager;
    use crate::signals::SignalStore;
    use crate::stream::spawn_event_pump;

    async fn spawn_server(dir: &std::path::Path) -> (std::net::SocketAddr, Arc<AppState>) {
        let mut config = ServerConfig::default();
        config.recording.storage_path = dir.join("recordings").to_string_lossy().to_string();
        config.detection.db_path = dir.join("signals.db").to_string_lossy().to_string();
        config.dsp.fft_size = 512;
        config.dsp.target_display_bins = 512;
        config.stream.target_fps = 200.0;
        let config = Arc::new(config);

        let factory: DriverFactory = Box::new(|status: &DeviceStatus| {
            Ok(Box::new(MockDriver::tone(status.sample_rate, 250e3, 0.5))
                as Box<dyn specan_backend::IqDriver>)
        });
        let receiver = Arc::new(Receiver::new(
            factory,
            config.initial_status(),
            config.limits(),
        ));
        let agc = Arc::new(SoftwareAgc::default());
        let detector = Arc::new(SignalDetector::new(config.detection_config()));
        let recording = Arc::new(RecordingManager::new(&config.recording));
        let store = Arc::new(
            SignalStore::open(&config.detection.db_path, config.detection.match_bandwidth_hz)
                .unwrap(),
        );

        let (manager, event_rx) = StreamManager::new(
            Arc::clone(&config),
            Arc::clone(&receiver),
            agc,
            detector,
            recording,
        );
        spawn_event_pump(Arc::clone(&manager), Arc::clone(&store), event_rx);
        let sweep = SweepEngine::new(Arc::clone(&manager), receiver, Arc::clone(&config));

        let state = Arc::new(AppState {
            config,
            manager,
            sweep,
            store,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener_state = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = run_listener(listener, listener_state, shutdown_rx).await;
            drop(_shutdown_tx);
        });
        (addr, state)
    }

    async fn read_frame(socket: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
        let mut header_buf = [0u8; 8];
        socket.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::parse(&header_buf).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        socket.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    async fn read_json(socket: &mut TcpStream) -> Value {
        loop {
            let (header, payload) = read_frame(socket).await;
            if header.message_type == MSG_JSON {
                return serde_json::from_slice(&payload).unwrap();
            }
        }
    }

    async fn send_line(socket: &mut TcpStream, line: &str) {
        socket.write_all(line.as_bytes()).await.unwrap();
        socket.write_all(b"\n").await.unwrap();
    }

    async fn wait_spectrum(socket: &mut TcpStream) {
        loop {
            let (header, _) = read_frame(socket).await;
            if header.message_type == MSG_SPECTRUM {
                return;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initial_status_then_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _state) = spawn_server(dir.path()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let initial = read_json(&mut socket).await;
        assert_eq!(initial["type"], "status");
        assert_eq!(initial["data"]["center_freq"], 100e6);
        assert_eq!(initial["data"]["fft_size"], 512);
        assert_eq!(initial["data"]["streaming"], false);
        assert_eq!(initial["data"]["sweep_mode"], "off");

        send_line(&mut socket, r#"{"cmd":"set_frequency","value":433.92e6}"#).await;
        let resp = read_json(&mut socket).await;
        assert_eq!(resp["data"]["ok"], true);
        assert_eq!(resp["data"]["center_freq"], 433.92e6);

        // Out-of-range tune is rejected but keeps the session alive.
        send_line(&mut socket, r#"{"cmd":"set_frequency","value":1.0}"#).await;
        let resp = read_json(&mut socket).await;
        assert_eq!(resp["data"]["ok"], false);

        send_line(&mut socket, r#"{"cmd":"get_status"}"#).await;
        let status = read_json(&mut socket).await;
        assert_eq!(status["data"]["center_freq"], 433.92e6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_and_unknown_commands_do_not_kill_session() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _state) = spawn_server(dir.path()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        read_json(&mut socket).await;

        send_line(&mut socket, "this is not json").await;
        let err = read_json(&mut socket).await;
        assert_eq!(err["type"], "error");

        // Unknown commands are only logged; the next command still works.
        send_line(&mut socket, r#"{"cmd":"warp_drive"}"#).await;
        send_line(&mut socket, r#"{"cmd":"get_status"}"#).await;
        let status = read_json(&mut socket).await;
        assert_eq!(status["type"], "status");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_reaches_all_clients_and_survives_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _state) = spawn_server(dir.path()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        read_json(&mut first).await;
        read_json(&mut second).await;

        send_line(&mut first, r#"{"cmd":"start"}"#).await;

        tokio::time::timeout(Duration::from_secs(5), wait_spectrum(&mut first))
            .await
            .expect("first client saw no spectrum");
        tokio::time::timeout(Duration::from_secs(5), wait_spectrum(&mut second))
            .await
            .expect("second client saw no spectrum");

        // Abrupt disconnect of one client must not disturb the other.
        drop(second);
        tokio::time::timeout(Duration::from_secs(5), wait_spectrum(&mut first))
            .await
            .expect("survivor stopped receiving");

        send_line(&mut first, r#"{"cmd":"stop"}"#).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fft_size_rejected_while_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, state) = spawn_server(dir.path()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        read_json(&mut socket).await;

        send_line(&mut socket, r#"{"cmd":"start"}"#).await;
        read_json(&mut socket).await;

        send_line(&mut socket, r#"{"cmd":"set_fft_size","value":4096}"#).await;
        let resp = read_json(&mut socket).await;
        assert_eq!(resp["type"], "error");

        send_line(&mut socket, r#"{"cmd":"stop"}"#).await;
        read_json(&mut socket).await;

        send_line(&mut socket, r#"{"cmd":"set_fft_size","value":4096}"#).await;
        let resp = read_json(&mut socket).await;
        assert_eq!(resp["data"]["ok"], true);
        assert_eq!(state.manager.dsp_pipeline().fft_size(), 4096);
    }
}
