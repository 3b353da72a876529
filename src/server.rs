//! HTTP/JSON control surface (spec §6.5, SPEC_FULL.md §6): one
//! `POST /api/sump/<verb>` route per scripting-surface command. Each route
//! takes a JSON body of whitespace-separated tokens and returns the
//! teacher's `CommandResult{success,message}` DTO shape (`ila.rs`). This
//! module performs token parsing and delegates to the core; it holds no
//! decoding or arbitration logic of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{CaptureConfiguration, SumpConfig};
use crate::decode::{hs, ls, rle};
use crate::driver::{AnalogTriggerSpec, ArmPlan, CaptureState, DeviceDriver, StatusEncoding};
use crate::error::{SumpError, SumpResult};
use crate::model::{collapse_user_ctrl, BitRip, Model, SignalId, SignalKind, SignalSource, Timezone, ViewDefinition, ViewId};
use crate::pza::{self, Archive};
use crate::topology::{self, NoromGranularity, Topology};
use crate::transport::TransportSession;
use crate::viewrom;

#[derive(Debug, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self { success: true, message: message.into() })
    }

    fn err(message: impl Into<String>) -> Json<Self> {
        Json(Self { success: false, message: message.into() })
    }
}

/// Shared mutable state behind the control surface. `model`/`topology`/
/// `capture_cfg` are plain data guarded by `parking_lot::Mutex` (short
/// critical sections, no `.await` held); `driver` is the one collaborator
/// whose methods are `async fn`, so it needs an async-aware lock.
pub struct AppState {
    model: parking_lot::Mutex<Model>,
    topology: parking_lot::Mutex<Topology>,
    sump_config: parking_lot::Mutex<SumpConfig>,
    capture_cfg: parking_lot::Mutex<CaptureConfiguration>,
    driver: AsyncMutex<Option<DeviceDriver>>,
    sump_connected: AtomicBool,
}

impl AppState {
    pub fn new(sump_config: SumpConfig) -> Self {
        Self {
            model: parking_lot::Mutex::new(Model::new()),
            topology: parking_lot::Mutex::new(Topology::default()),
            sump_config: parking_lot::Mutex::new(sump_config),
            capture_cfg: parking_lot::Mutex::new(CaptureConfiguration::default()),
            driver: AsyncMutex::new(None),
            sump_connected: AtomicBool::new(false),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/create_signal", post(create_signal))
        .route("/create_group", post(create_group))
        .route("/end_group", post(end_group))
        .route("/create_bit_group", post(create_bit_group))
        .route("/create_fsm_state", post(create_fsm_state))
        .route("/create_view", post(create_view))
        .route("/end_view", post(end_view))
        .route("/add_view", post(add_view))
        .route("/apply_view", post(apply_view))
        .route("/remove_view", post(remove_view))
        .route("/add_view_ontap", post(add_view_ontap))
        .route("/apply_attribute", post(apply_attribute))
        .route("/sump_connect", post(sump_connect))
        .route("/sump_arm", post(sump_arm))
        .route("/sump_acquire", post(sump_acquire))
        .route("/sump_force_trig", post(sump_force_trig))
        .route("/sump_force_stop", post(sump_force_stop))
        .route("/sump_download", post(sump_download))
        .route("/sump_set_trigs", post(sump_set_trigs))
        .route("/sump_clear_trigs", post(sump_clear_trigs))
        .route("/save_pza", post(save_pza))
        .route("/load_pza", post(load_pza))
        .route("/save_vcd", post(save_vcd))
        .route("/save_list", post(save_list))
        .with_state(state)
}

// ----------------------------------------------------------------------
// Token parsing helpers
// ----------------------------------------------------------------------

fn parse_err(what: &str, tok: &str) -> SumpError {
    SumpError::ConfigParse {
        context: "server token".to_string(),
        message: format!("bad {what}: {tok:?}"),
    }
}

fn parse_bitrip(tok: &str) -> SumpResult<BitRip> {
    if let Some(rest) = tok.strip_prefix("bit:") {
        rest.parse().map(BitRip::Bit).map_err(|_| parse_err("bitrip", tok))
    } else if let Some(rest) = tok.strip_prefix("range:") {
        let (hi, lo) = rest.split_once(':').ok_or_else(|| parse_err("bitrip", tok))?;
        let hi: u32 = hi.parse().map_err(|_| parse_err("bitrip", tok))?;
        let lo: u32 = lo.parse().map_err(|_| parse_err("bitrip", tok))?;
        Ok(BitRip::Range { hi, lo })
    } else {
        Err(parse_err("bitrip", tok))
    }
}

/// "ls_analog:<ch>" | "ls_digital:<bitrip>" | "hs_digital:<bitrip>" |
/// "rle_digital:<hub>:<pod>:<bitrip>"
fn parse_source(tok: &str) -> SumpResult<SignalSource> {
    if let Some(rest) = tok.strip_prefix("ls_analog:") {
        let channel: usize = rest.parse().map_err(|_| parse_err("source", tok))?;
        Ok(SignalSource::AnalogLs { channel })
    } else if let Some(rest) = tok.strip_prefix("ls_digital:") {
        Ok(SignalSource::DigitalLs { rip: parse_bitrip(rest)? })
    } else if let Some(rest) = tok.strip_prefix("hs_digital:") {
        Ok(SignalSource::DigitalHs { rip: parse_bitrip(rest)? })
    } else if let Some(rest) = tok.strip_prefix("rle_digital:") {
        let mut parts = rest.splitn(3, ':');
        let hub: u8 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| parse_err("source", tok))?;
        let pod: u8 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| parse_err("source", tok))?;
        let rip = parse_bitrip(parts.next().ok_or_else(|| parse_err("source", tok))?)?;
        Ok(SignalSource::DigitalRle { hub, pod, rip })
    } else {
        Err(parse_err("source", tok))
    }
}

fn parse_kind(tok: &str) -> SignalKind {
    match tok {
        "analog" => SignalKind::Analog,
        "group" => SignalKind::Group,
        "spacer" => SignalKind::Spacer,
        "clock" => SignalKind::Clock,
        _ => SignalKind::Digital,
    }
}

fn parse_timezone(tok: &str) -> Option<Timezone> {
    match tok {
        "ls" => Some(Timezone::Ls),
        "hs" => Some(Timezone::Hs),
        "rle" => Some(Timezone::Rle),
        _ => None,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> SumpResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(parse_err("hex payload", s));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| parse_err("hex payload", s)))
        .collect()
}

// ----------------------------------------------------------------------
// Signal/View model verbs
// ----------------------------------------------------------------------

async fn create_signal(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [name, source, kind] = match req.tokens.as_slice() {
        [a, b, c] => [a.as_str(), b.as_str(), c.as_str()],
        _ => return CommandResult::err("create_signal expects <name> <source> <kind>"),
    };
    let source = match parse_source(source) {
        Ok(s) => s,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    let id = state.model.lock().create_signal(name, source, parse_kind(kind));
    CommandResult::ok(format!("signal {id} created"))
}

async fn create_group(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let Some(name) = req.tokens.first() else {
        return CommandResult::err("create_group expects <name>");
    };
    let id = state.model.lock().create_group(name);
    CommandResult::ok(format!("group {id} created"))
}

async fn end_group(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    state.model.lock().end_group();
    CommandResult::ok("group ended")
}

async fn create_bit_group(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [name, hi, lo, source] = match req.tokens.as_slice() {
        [a, b, c, d] => [a.as_str(), b.as_str(), c.as_str(), d.as_str()],
        _ => return CommandResult::err("create_bit_group expects <name> <hi> <lo> <source>"),
    };
    let (Ok(hi), Ok(lo)) = (hi.parse::<u16>(), lo.parse::<u16>()) else {
        return CommandResult::err("create_bit_group: hi/lo must be integers");
    };
    let source = match parse_source(source) {
        Ok(s) => s,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    let id = state.model.lock().create_bit_group(name, hi, lo, source);
    CommandResult::ok(format!("bit group {id} created"))
}

async fn create_fsm_state(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [signal, value, name] = match req.tokens.as_slice() {
        [a, b, c] => [a.as_str(), b.as_str(), c.as_str()],
        _ => return CommandResult::err("create_fsm_state expects <signal_id> <value> <name>"),
    };
    let (Ok(signal), Ok(value)) = (signal.parse::<SignalId>(), value.parse::<u8>()) else {
        return CommandResult::err("create_fsm_state: signal_id/value must be integers");
    };
    match state.model.lock().create_fsm_state(signal, value, name) {
        Ok(()) => CommandResult::ok("fsm state added"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn create_view(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [name, tz] = match req.tokens.as_slice() {
        [a, b] => [a.as_str(), b.as_str()],
        _ => return CommandResult::err("create_view expects <name> <timezone>"),
    };
    let def = ViewDefinition {
        name: name.to_string(),
        timezone: parse_timezone(tz),
        ..Default::default()
    };
    let id = state.model.lock().create_view(def);
    CommandResult::ok(format!("view {id} created"))
}

async fn end_view(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    state.model.lock().end_view();
    CommandResult::ok("view ended")
}

async fn add_view_ontap(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [name, rom_hex] = match req.tokens.as_slice() {
        [a, b] => [a.as_str(), b.as_str()],
        _ => return CommandResult::err("add_view_ontap expects <name> <rom_hex>"),
    };
    state.model.lock().add_view_ontap(name, rom_hex);
    CommandResult::ok(format!("view-ontap {name} registered"))
}

/// For every pod the topology discovered without a view-ROM, synthesize its
/// default "hub_name.pod_name" view (spec §4.3 "Synthetic no-ROM fallback").
/// Runs once at connect time, before any client-supplied ROM is applied, so
/// the merge rule's "search every create_signal's source for that pod"
/// dedup check has nothing yet to dedup against.
fn synthesize_norom_views(model: &mut Model, topology: &Topology) {
    for hub in &topology.hubs {
        let hub_name = hub.name.as_deref().unwrap_or("hub");
        for pod in &hub.pods {
            if pod.view_rom_present {
                continue;
            }
            let pod_name = pod.name.as_deref().unwrap_or("pod");
            let bits_per_signal = match pod.norom_granularity {
                Some(NoromGranularity::Dword) => 32,
                Some(NoromGranularity::Word) => 16,
                Some(NoromGranularity::Byte) => 8,
                Some(NoromGranularity::Bit) | None => 1,
            };
            model.generate_norom_signals(
                hub.index,
                pod.index,
                pod.data_bits as u32,
                bits_per_signal,
                format!("{hub_name}.{pod_name}"),
            );
        }
    }
}

/// Replay a normalized view-ROM command stream (spec §4.3) into the model,
/// tracking the source-selector and last-created-signal context the way a
/// single-pass ROM interpreter would.
fn apply_rom_commands(model: &mut Model, topology: &Topology, commands: &[viewrom::Command]) -> SumpResult<ViewId> {
    let mut view_id: Option<ViewId> = None;
    let mut current_hub_pod: Option<(u8, u8)> = None;
    let mut last_signal: Option<SignalId> = None;
    let dict = topology.name_dict();

    let resolve_source = |rip: BitRip, hub_pod: Option<(u8, u8)>| -> SignalSource {
        match hub_pod {
            Some((hub, pod)) => SignalSource::DigitalRle { hub, pod, rip },
            None => SignalSource::DigitalHs { rip },
        }
    };

    for cmd in commands {
        match cmd {
            viewrom::Command::CreateView { name } => {
                let id = model.create_view(ViewDefinition { name: name.clone(), ..Default::default() });
                view_id = Some(id);
            }
            viewrom::Command::EndView => model.end_view(),
            viewrom::Command::CreateGroup { name } => {
                last_signal = Some(model.create_group(name.clone()));
            }
            viewrom::Command::EndGroup => model.end_group(),
            viewrom::Command::SourceThisPod => current_hub_pod = Some((0, 0)),
            viewrom::Command::SourceHubPod { hub, pod } => current_hub_pod = Some((*hub, *pod)),
            viewrom::Command::SourceByName { name } => {
                current_hub_pod = dict.get(name).copied();
            }
            viewrom::Command::EndSource => current_hub_pod = None,
            viewrom::Command::CreateBitSignal { name, bit } => {
                let source = resolve_source(BitRip::Bit(*bit), current_hub_pod);
                last_signal = Some(model.create_signal(name.clone(), source, SignalKind::Digital));
            }
            viewrom::Command::CreateVectorSignal { name, hi, lo } => {
                let source = resolve_source(BitRip::Range { hi: *hi as u32, lo: *lo as u32 }, current_hub_pod);
                last_signal = Some(model.create_signal(name.clone(), source, SignalKind::Digital));
            }
            viewrom::Command::CreateFsmState { value, name } => {
                if let Some(sig) = last_signal {
                    model.create_fsm_state(sig, *value, name.clone())?;
                }
            }
            viewrom::Command::CreateBitGroup { name, hi, lo } => {
                let source = resolve_source(BitRip::Bit(0), current_hub_pod);
                last_signal = Some(model.create_bit_group(name.clone(), *hi, *lo, source));
            }
            viewrom::Command::ApplyAttribute { text } => {
                if let (Some(sig), Some((key, value))) = (last_signal, text.split_once(' ')) {
                    model.apply_attribute(sig, key, value)?;
                }
            }
            viewrom::Command::ShellCommand { .. } | viewrom::Command::RomEnd => {}
        }
    }

    view_id.ok_or_else(|| SumpError::ConfigParse {
        context: "add_view".to_string(),
        message: "rom stream defined no view".to_string(),
    })
}

async fn add_view(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let Some(name) = req.tokens.first() else {
        return CommandResult::err("add_view expects <name>");
    };
    let rom_hex = {
        let model = state.model.lock();
        match model.ontap.get(name) {
            Some(text) => text.to_string(),
            None => return CommandResult::err(format!("no view-ontap entry named {name}")),
        }
    };
    let bytes = match from_hex(&rom_hex) {
        Ok(b) => b,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    let commands = match viewrom::parse(&bytes) {
        Ok(c) => c,
        Err(e) => return CommandResult::err(e.to_string()),
    };

    let mut model = state.model.lock();
    let topology = state.topology.lock();
    match apply_rom_commands(&mut model, &topology, &commands) {
        Ok(id) => CommandResult::ok(format!("view {id} added")),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn apply_view(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [window, view_id] = match req.tokens.as_slice() {
        [a, b] => [a.as_str(), b.as_str()],
        _ => return CommandResult::err("apply_view expects <window> <view_id>"),
    };
    let (Ok(window), Ok(view_id)) = (window.parse::<u8>(), view_id.parse::<ViewId>()) else {
        return CommandResult::err("apply_view: window/view_id must be integers");
    };
    match state.model.lock().apply_view(window, view_id) {
        Ok(removed) if removed.is_empty() => CommandResult::ok("view applied"),
        Ok(removed) => CommandResult::err(format!("view applied; removed conflicting views {removed:?}")),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn remove_view(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let Some(view_id) = req.tokens.first().and_then(|s| s.parse::<ViewId>().ok()) else {
        return CommandResult::err("remove_view expects <view_id>");
    };
    state.model.lock().remove_view(view_id);
    CommandResult::ok("view removed")
}

async fn apply_attribute(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [signal, key, value] = match req.tokens.as_slice() {
        [a, b, c] => [a.as_str(), b.as_str(), c.as_str()],
        _ => return CommandResult::err("apply_attribute expects <signal_id> <key> <value>"),
    };
    let Ok(signal) = signal.parse::<SignalId>() else {
        return CommandResult::err("apply_attribute: signal_id must be an integer");
    };
    match state.model.lock().apply_attribute(signal, key, value) {
        Ok(()) => CommandResult::ok("attribute applied"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

// ----------------------------------------------------------------------
// Hardware session verbs
// ----------------------------------------------------------------------

async fn sump_connect(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let (host, port, aes_key, authenticate) = {
        let cfg = state.sump_config.lock();
        let host = req.tokens.first().cloned().unwrap_or_else(|| cfg.host.clone());
        let port = req.tokens.get(1).and_then(|p| p.parse().ok()).unwrap_or(cfg.port);
        (host, port, cfg.aes_key, cfg.authenticate)
    };

    let session = match TransportSession::connect(&host, port, aes_key, authenticate).await {
        Ok(s) => s,
        Err(e) => return CommandResult::err(e.to_string()),
    };

    let mut driver = DeviceDriver::new(session, 0, StatusEncoding::Modern);
    if let Err(e) = driver.require_hardware().await {
        return CommandResult::err(e.to_string());
    }
    if let Err(e) = driver.request_thread_id().await {
        return CommandResult::err(e.to_string());
    }

    match topology::discover(&mut driver).await {
        Ok(topo) => {
            let mut model = state.model.lock();
            synthesize_norom_views(&mut model, &topo);
            drop(model);
            *state.topology.lock() = topo;
        }
        Err(e) => tracing::warn!(error = %e, "topology discovery failed; continuing with empty topology"),
    }

    *state.driver.lock().await = Some(driver);
    state.sump_connected.store(true, Ordering::SeqCst);
    CommandResult::ok(format!("connected to {host}:{port}"))
}

/// Collapse the model's attached views and `rle_masked` signals into an
/// [`ArmPlan`] (spec §4.2 "Arm sequence"). Lives here, not in `model.rs` or
/// `driver.rs`, to keep those two collaborators decoupled from each other.
fn build_arm_plan(model: &Model) -> ArmPlan {
    let mut user_ctrl: HashMap<(u8, u8), Vec<(BitRip, u32)>> = HashMap::new();
    for vid in model.attached_views() {
        if let Some(view) = model.view(vid) {
            for (hub, pod, list) in &view.hub_pod_user_ctrl {
                user_ctrl.entry((*hub, *pod)).or_default().extend(list.clone());
            }
        }
    }
    let pod_user_ctrl = user_ctrl
        .iter()
        .map(|(&(hub, pod), list)| ((hub, pod), collapse_user_ctrl(list).1))
        .collect();

    let mut rle_mask: HashMap<(u8, u8), u32> = HashMap::new();
    for (_, sig) in model.signals() {
        if !sig.rle_masked {
            continue;
        }
        if let Some(SignalSource::DigitalRle { hub, pod, rip }) = sig.source {
            let mask = collapse_user_ctrl(&[(rip, 0)]).0;
            *rle_mask.entry((hub, pod)).or_insert(0) |= mask;
        }
    }
    let pod_rle_mask = rle_mask.into_iter().collect();

    let trigger = model.signals().find(|(_, s)| s.trigger).map(|(_, s)| s.clone());
    let (trigger_type, trigger_digital_field, analog_trigger, pod_trigger_enable, pod_trigger_cfg) = match trigger {
        Some(sig) => match sig.source {
            Some(SignalSource::AnalogLs { channel }) => {
                let level = sig.trigger_field as f64;
                let code = ((level - sig.units.offset_units) / sig.units.units_per_code.max(f64::EPSILON)) as u32;
                (0x04, 0, Some(AnalogTriggerSpec { channel: channel as u8, code }), Vec::new(), Vec::new())
            }
            Some(SignalSource::DigitalRle { hub, pod, rip }) => {
                let mask = collapse_user_ctrl(&[(rip, 0)]).0;
                (0x02, 0, None, vec![((hub, pod), mask)], vec![((hub, pod), 0x21u8)])
            }
            Some(SignalSource::DigitalLs { rip }) | Some(SignalSource::DigitalHs { rip }) => {
                let mask = collapse_user_ctrl(&[(rip, 0)]).0;
                (0x02, mask, None, Vec::new(), Vec::new())
            }
            None => (0x02, 1, None, Vec::new(), Vec::new()),
        },
        None => (0x02, 1, None, Vec::new(), Vec::new()),
    };

    ArmPlan {
        pod_user_ctrl,
        pod_rle_mask,
        trigger_type,
        trigger_digital_field,
        analog_trigger,
        pod_trigger_enable,
        pod_trigger_cfg,
    }
}

async fn sump_arm(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let plan = build_arm_plan(&state.model.lock());
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    match driver.arm(&plan).await {
        Ok(()) => CommandResult::ok("armed"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn sump_acquire(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let timeout_ms: u64 = req.tokens.first().and_then(|s| s.parse().ok()).unwrap_or(30_000);
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    match driver.poll_until(Duration::from_millis(timeout_ms), |s| matches!(s, CaptureState::Acquired)).await {
        Ok(_) => CommandResult::ok("acquired"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// One-shot software trigger: pulse `force_trig` then clear it, since the
/// hardware bit is not self-clearing (driver.rs) but the scripting verb is.
async fn sump_force_trig(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    if let Err(e) = driver.force_trig().await {
        return CommandResult::err(e.to_string());
    }
    match driver.clear_force_trig().await {
        Ok(()) => CommandResult::ok("force-triggered"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn sump_force_stop(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    match driver.force_stop().await {
        Ok(()) => CommandResult::ok("stopped"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn sump_set_trigs(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [hub, pod, enable, cfg] = match req.tokens.as_slice() {
        [a, b, c, d] => [a.as_str(), b.as_str(), c.as_str(), d.as_str()],
        _ => return CommandResult::err("sump_set_trigs expects <hub> <pod> <enable_mask> <cfg_byte>"),
    };
    let (Ok(hub), Ok(pod), Ok(enable), Ok(cfg)) = (hub.parse::<u8>(), pod.parse::<u8>(), u32::from_str_radix(enable.trim_start_matches("0x"), 16), u8::from_str_radix(cfg.trim_start_matches("0x"), 16)) else {
        return CommandResult::err("sump_set_trigs: fields must parse as integers");
    };
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    use crate::driver::{POD_REG_TRIG_CFG, POD_REG_TRIG_EN};
    if let Err(e) = driver.set_pod_reg(hub, pod, POD_REG_TRIG_EN, enable).await {
        return CommandResult::err(e.to_string());
    }
    match driver.set_pod_reg(hub, pod, POD_REG_TRIG_CFG, cfg as u32).await {
        Ok(()) => CommandResult::ok("trigger config written"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

async fn sump_clear_trigs(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let [hub, pod] = match req.tokens.as_slice() {
        [a, b] => [a.as_str(), b.as_str()],
        _ => return CommandResult::err("sump_clear_trigs expects <hub> <pod>"),
    };
    let (Ok(hub), Ok(pod)) = (hub.parse::<u8>(), pod.parse::<u8>()) else {
        return CommandResult::err("sump_clear_trigs: hub/pod must be integers");
    };
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };
    match driver.set_pod_reg(hub, pod, crate::driver::POD_REG_TRIG_EN, 0).await {
        Ok(()) => CommandResult::ok("trigger enable cleared"),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Total row bits for one RLE pod, used to size the register-level page
/// sweep (spec §4.4.3 "Register-level download").
fn rle_page_count(ts_bits: u8, data_bits: u16) -> usize {
    (2 + ts_bits as usize + data_bits as usize).div_ceil(32)
}

async fn sump_download(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let mut guard = state.driver.lock().await;
    let Some(driver) = guard.as_mut() else {
        return CommandResult::err("not connected");
    };

    let (digital_depth, alignment) = {
        let cfg = state.capture_cfg.lock();
        (cfg.digital_ram_depth as usize, state.sump_config.lock().ls_ana_dig_alignment)
    };
    let (header_len, digital_len, analog_len) = {
        let cfg = state.capture_cfg.lock();
        let (_, header, digital, analog) = cfg.record_profile_bytes();
        (header, digital, analog)
    };

    if digital_depth > 0 {
        match driver.read_ls_ram(digital_depth).await {
            Ok(raw) => {
                let records = ls::decode(&raw, header_len, digital_len, analog_len);
                state.model.lock().bind_ls(&records, alignment);
            }
            Err(e) => tracing::warn!(error = %e, "ls ram download failed"),
        }

        match driver.read_hs_ram(digital_depth).await {
            Ok(raw) => {
                let lines = hs::decode(&raw, digital_len.max(1) as usize);
                state.model.lock().bind_hs(&lines);
            }
            Err(e) => tracing::warn!(error = %e, "hs ram download failed"),
        }
    }

    let pods: Vec<(u8, u8, usize, u8, u16, topology::ClockFreq)> = {
        let topo = state.topology.lock();
        topo.hubs
            .iter()
            .flat_map(|h| {
                let clock = h.clock;
                h.pods
                    .iter()
                    .map(move |p| (h.index, p.index, p.ram_depth() as usize, p.ts_bits, p.data_bits, clock))
            })
            .collect()
    };

    for (hub, pod, depth, ts_bits, data_bits, clock) in pods {
        let num_pages = rle_page_count(ts_bits, data_bits);
        let pages = match driver.read_pod_ram_pages(hub, pod, depth, num_pages).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(hub, pod, error = %e, "rle pod download failed");
                continue;
            }
        };

        let captured_user_ctrl = driver.pod_reg(hub, pod, crate::driver::POD_REG_USER_CTRL).await.unwrap_or(0);
        let bit_mask = driver.pod_reg(hub, pod, crate::driver::POD_REG_RLE_MASK).await.unwrap_or(0);
        let latency = driver.pod_reg(hub, pod, crate::driver::POD_REG_TRIG_LATENCY).await.unwrap_or(0);
        let clock_ps = (1_000_000.0 / clock.mhz()).round() as i64;

        let params = rle::RleParams {
            ts_bits,
            data_bits: data_bits as u8,
            clock_ps,
            trigger_miso_latency_ps: ((latency >> 8) & 0xFF) as i64 * clock_ps,
            pod_core_clock_ps: clock_ps,
            trigger_core_cycles: (latency & 0xFF) as i64,
            trigger_mosi_cycles: ((latency >> 16) & 0xFF) as i64,
            bit_mask,
        };

        match rle::decode(&pages, depth, &params, hub, pod) {
            Ok(samples) => state.model.lock().bind_rle(hub, pod, captured_user_ctrl, &samples, bit_mask),
            Err(e) => tracing::warn!(hub, pod, error = %e, "rle sample decode failed"),
        }
    }

    CommandResult::ok("download complete")
}

// ----------------------------------------------------------------------
// Artifact verbs
// ----------------------------------------------------------------------

async fn save_pza(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let mut archive = Archive::default();
    let cfg = state.capture_cfg.lock().clone();
    archive.set(pza::CAPTURE_CFG, cfg.to_lines().join("\n"));

    match pza::save(&archive) {
        Ok(bytes) => CommandResult::ok(to_hex(&bytes)),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Scenario S6: loading an archive populates the in-memory configuration
/// and marks the session disconnected from live hardware, synthesizing
/// absent RAM/sample files as empty rather than erroring.
async fn load_pza(State(state): State<Arc<AppState>>, Json(req): Json<CommandRequest>) -> Json<CommandResult> {
    let Some(hex) = req.tokens.first() else {
        return CommandResult::err("load_pza expects <hex_bytes>");
    };
    let bytes = match from_hex(hex) {
        Ok(b) => b,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    let archive = match pza::load(&bytes) {
        Ok(a) => a,
        Err(e) => return CommandResult::err(e.to_string()),
    };

    if let Some(text) = archive.get(pza::CAPTURE_CFG) {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        match CaptureConfiguration::from_lines(&lines) {
            Ok(cfg) => *state.capture_cfg.lock() = cfg,
            Err(e) => return CommandResult::err(e.to_string()),
        }
    }

    state.sump_connected.store(false, Ordering::SeqCst);
    *state.driver.lock().await = None;
    CommandResult::ok("archive loaded; session is offline")
}

async fn save_vcd(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let model = state.model.lock();
    let cfg = state.capture_cfg.lock();

    // Sample period per spec §4.5 "Trigger-index and sample-period": 1/dig_freq
    // MHz for HS, 1/tick_freq x tick_divisor for LS; RLE timestamps are already
    // absolute ps and carried per-sample in `rle_time`, not derived from a period.
    let ls_period_ps = if cfg.tick_freq_hz > 0.0 {
        (cfg.tick_divisor as f64 / cfg.tick_freq_hz * 1e12).round() as i64
    } else {
        0
    };
    let hs_period_ps = if cfg.tick_freq_hz > 0.0 { (1e12 / cfg.tick_freq_hz).round() as i64 } else { 0 };

    let mut out = String::from("$timescale 1ps $end\n$scope module uut $upscope $end\n$enddefinitions $end\n");
    for (id, sig) in model.signals() {
        if sig.kind != SignalKind::Digital && sig.kind != SignalKind::Analog {
            continue;
        }
        out.push_str(&format!("$var wire 1 s{id} {} $end\n", sig.name));
    }
    out.push_str("$dumpvars\n");
    for (id, sig) in model.signals() {
        for (i, v) in sig.values.iter().enumerate() {
            if let crate::model::SampleValue::Code(code) = v {
                let time_ps = match sig.timezone {
                    Some(Timezone::Rle) => sig.rle_time.get(i).copied().unwrap_or(0),
                    Some(Timezone::Hs) => i as i64 * hs_period_ps,
                    Some(Timezone::Ls) | None => i as i64 * ls_period_ps,
                };
                out.push_str(&format!("#{time_ps}\n{code} s{id}\n"));
            }
        }
    }
    CommandResult::ok(out)
}

async fn save_list(State(state): State<Arc<AppState>>, Json(_req): Json<CommandRequest>) -> Json<CommandResult> {
    let model = state.model.lock();
    let mut out = String::new();
    for (id, sig) in model.signals() {
        out.push_str(&format!("{id} {} {:?} values={}\n", sig.name, sig.kind, sig.values.len()));
    }
    CommandResult::ok(out)
}
