//! Device Driver (spec §4.2): the hardware's two-register command/data
//! convention, opcode table, status/state machine, cooperative
//! thread-pool/lock protocol, and bulk-readout helpers.

use std::time::Duration;

use crate::error::{SumpError, SumpResult};
use crate::transport::TransportSession;

/// Bulk reads/writes larger than this are chunked (spec §4.2).
pub const BULK_CHUNK_WORDS: usize = 1024;

const REG_CTRL_OFFSET: u32 = 0x00;
const REG_DATA_OFFSET: u32 = 0x04;

const TRIG_WIDTH_CLOCKS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // State transitions
    Idle = 0x00,
    Arm = 0x01,
    Reset = 0x02,
    Init = 0x03,
    Sleep = 0x04,

    // Config reads
    RdHwId = 0x10,
    RdAnalogRamGeom = 0x11,
    RdStatus = 0x12,
    RdDigitalRamGeom = 0x13,
    RdRecordProfile = 0x14,
    RdTrigSource = 0x15,
    RdViewRomSize = 0x16,
    RdTickFreq = 0x17,
    RdDigClockFreq = 0x18,

    // Config writes
    WrUserCtrl = 0x20,
    WrRecordConfig = 0x21,
    WrTickDivisor = 0x22,
    WrTrigType = 0x23,
    WrTrigDigField = 0x24,
    WrTrigAnalogField = 0x25,
    WrLsPostTrig = 0x26,
    WrHsPostTrig = 0x27,
    WrTrigDelay = 0x28,
    WrTrigNth = 0x29,
    WrDigPostTrig = 0x2A,
    WrRamReadPtr = 0x2B,
    WrRamReadPage = 0x2C,
    WrForceTrig = 0x2D,

    // Serial bus reads
    RdHubFreq = 0x30,
    RdPodCount = 0x31,
    RdPodReg = 0x32,
    RdHubInstance = 0x35,
    RdHubName03 = 0x36,
    RdHubName47 = 0x37,
    RdHubName8_11 = 0x38,
    RdLsRamBulk = 0x39,
    RdHsRamBulk = 0x3A,

    // Serial bus writes
    WrPodInstance = 0x3F,
    WrPodReg = 0x40,

    // Thread pool / thread lock
    RdThreadPoolSet = 0x50,
    WrThreadPoolSet = 0x51,
    RdThreadLock = 0x52,
    WrThreadLockSet = 0x53,
    WrThreadLockClr = 0x54,
}

// Pod sub-register addresses (spec §4.2).
pub const POD_REG_HW_CFG: u8 = 0x00;
pub const POD_REG_USER_CTRL: u8 = 0x01;
pub const POD_REG_RLE_MASK: u8 = 0x02;
pub const POD_REG_TRIG_CFG: u8 = 0x03;
pub const POD_REG_TRIG_EN: u8 = 0x04;
pub const POD_REG_RAM_PTR: u8 = 0x08;
pub const POD_REG_RAM_DATA: u8 = 0x09;
pub const POD_REG_RAM_CFG: u8 = 0x0A;
pub const POD_REG_RAM_PAGE: u8 = 0x0B;
pub const POD_REG_TRIGGERABLE: u8 = 0x0E;
pub const POD_REG_TRIG_LATENCY: u8 = 0x0F;
pub const POD_REG_INSTANCE: u8 = 0x1C;
pub const POD_REG_NAME_0_3: u8 = 0x1D;
pub const POD_REG_NAME_4_7: u8 = 0x1E;
pub const POD_REG_NAME_8_11: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    PreTrigFill,
    Triggered,
    Acquired,
    Unknown(u8),
}

/// Decode the 5-bit (modern) or legacy status byte into a `CaptureState`,
/// honoring the priority order in spec §4.2/§6.1.
pub fn decode_status(raw: u8) -> CaptureState {
    let armed = raw & 0x01 != 0;
    let pretrig = raw & 0x02 != 0;
    let triggered = raw & 0x04 != 0;
    let acquired = raw & 0x08 != 0;

    if acquired {
        CaptureState::Acquired
    } else if triggered {
        CaptureState::Triggered
    } else if armed && !pretrig {
        CaptureState::PreTrigFill
    } else if armed {
        CaptureState::Armed
    } else if raw == 0x00 {
        CaptureState::Idle
    } else {
        CaptureState::Unknown(raw)
    }
}

/// Which status encoding a given hardware revision uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEncoding {
    Legacy,
    Modern,
}

pub struct AnalogTriggerSpec {
    pub channel: u8,
    /// Raw ADC code, already converted from (level - offset_units) / units_per_code.
    pub code: u32,
}

impl AnalogTriggerSpec {
    /// Pack as (ch<<24 | code[23:0]).
    pub fn packed(&self) -> u32 {
        ((self.channel as u32) << 24) | (self.code & 0x00FF_FFFF)
    }
}

pub struct ArmPlan {
    pub pod_user_ctrl: Vec<((u8, u8), u32)>,
    pub pod_rle_mask: Vec<((u8, u8), u32)>,
    pub trigger_type: u32,
    pub trigger_digital_field: u32,
    pub analog_trigger: Option<AnalogTriggerSpec>,
    pub pod_trigger_enable: Vec<((u8, u8), u32)>,
    pub pod_trigger_cfg: Vec<((u8, u8), u8)>,
}

pub struct DeviceDriver {
    session: TransportSession,
    base: u32,
    status_encoding: StatusEncoding,
    thread_id: Option<u8>,
}

impl DeviceDriver {
    pub fn new(session: TransportSession, base: u32, status_encoding: StatusEncoding) -> Self {
        Self {
            session,
            base,
            status_encoding,
            thread_id: None,
        }
    }

    fn ctrl_addr(&self) -> u32 {
        self.base + REG_CTRL_OFFSET
    }

    fn data_addr(&self) -> u32 {
        self.base + REG_DATA_OFFSET
    }

    async fn write_opcode(&mut self, op: Opcode) -> SumpResult<()> {
        self.session.write(self.ctrl_addr(), &[op as u32], false).await
    }

    async fn write_data(&mut self, value: u32) -> SumpResult<()> {
        self.session.write(self.data_addr(), &[value], false).await
    }

    async fn read_data(&mut self) -> SumpResult<u32> {
        Ok(self.session.read(self.data_addr(), 1, false).await?[0])
    }

    async fn read_ctrl_raw(&mut self) -> SumpResult<u32> {
        Ok(self.session.read(self.ctrl_addr(), 1, false).await?[0])
    }

    /// Read-then-opcode: latch `input` into data, issue `op`, read the result.
    pub(crate) async fn exec_read(&mut self, op: Opcode, input: Option<u32>) -> SumpResult<u32> {
        if let Some(v) = input {
            self.write_data(v).await?;
        }
        self.write_opcode(op).await?;
        self.read_data().await
    }

    pub(crate) async fn exec_write(&mut self, op: Opcode, value: u32) -> SumpResult<()> {
        self.write_data(value).await?;
        self.write_opcode(op).await
    }

    /// Bulk read from the data register, chunked at [`BULK_CHUNK_WORDS`].
    pub async fn read_bulk(&mut self, op: Opcode, n: usize) -> SumpResult<Vec<u32>> {
        self.write_opcode(op).await?;
        let mut out = Vec::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(BULK_CHUNK_WORDS);
            let words = self.session.read(self.data_addr(), chunk, false).await?;
            out.extend(words);
            remaining -= chunk;
        }
        Ok(out)
    }

    pub async fn hw_id(&mut self) -> SumpResult<u8> {
        let v = self.exec_read(Opcode::RdHwId, None).await?;
        Ok((v & 0xFF) as u8)
    }

    pub async fn require_hardware(&mut self) -> SumpResult<()> {
        let id = self.hw_id().await?;
        if id != 0x53 {
            return Err(SumpError::HardwareMissing { got: id });
        }
        Ok(())
    }

    pub async fn status(&mut self) -> SumpResult<CaptureState> {
        let raw = match self.status_encoding {
            StatusEncoding::Legacy => (self.exec_read(Opcode::RdStatus, None).await? & 0xFF) as u8,
            StatusEncoding::Modern => ((self.read_ctrl_raw().await? >> 24) & 0x1F) as u8,
        };
        Ok(decode_status(raw))
    }

    /// Poll status until `pred` holds, sleeping ~1s between reads.
    pub async fn poll_until(
        &mut self,
        timeout: Duration,
        pred: impl Fn(CaptureState) -> bool,
    ) -> SumpResult<CaptureState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.status().await?;
            if pred(state) {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SumpError::HardwareStuck {
                    state,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn read_pod_reg(&mut self, hub: u8, pod: u8, reg: u8) -> SumpResult<u32> {
        let addr = ((hub as u32) << 16) | ((pod as u32) << 8) | reg as u32;
        self.exec_write(Opcode::WrPodInstance, addr).await?;
        self.exec_read(Opcode::RdPodReg, None).await
    }

    async fn write_pod_reg(&mut self, hub: u8, pod: u8, reg: u8, value: u32) -> SumpResult<()> {
        let addr = ((hub as u32) << 16) | ((pod as u32) << 8) | reg as u32;
        self.exec_write(Opcode::WrPodInstance, addr).await?;
        self.exec_write(Opcode::WrPodReg, value).await
    }

    pub async fn read_hub_name(&mut self, hub: u8) -> SumpResult<String> {
        let addr = (hub as u32) << 16;
        let mut bytes = Vec::with_capacity(12);
        for op in [Opcode::RdHubName03, Opcode::RdHubName47, Opcode::RdHubName8_11] {
            let word = self.exec_read(op, Some(addr)).await?;
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    pub async fn read_pod_name(&mut self, hub: u8, pod: u8) -> SumpResult<String> {
        let mut bytes = Vec::with_capacity(12);
        for reg in [POD_REG_NAME_0_3, POD_REG_NAME_4_7, POD_REG_NAME_8_11] {
            let word = self.read_pod_reg(hub, pod, reg).await?;
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    pub async fn pod_reg(&mut self, hub: u8, pod: u8, reg: u8) -> SumpResult<u32> {
        self.read_pod_reg(hub, pod, reg).await
    }

    pub async fn set_pod_reg(&mut self, hub: u8, pod: u8, reg: u8, value: u32) -> SumpResult<()> {
        self.write_pod_reg(hub, pod, reg, value).await
    }

    /// Download one RLE RAM page: `depth` DWORDs, one register round-trip
    /// per word. RLE pages are read register-by-register rather than via
    /// the `read_bulk` burst opcode because each page lives behind its own
    /// pod instance selector, not the hub-level burst address space.
    pub async fn read_pod_ram_page(&mut self, hub: u8, pod: u8, depth: usize) -> SumpResult<Vec<u32>> {
        let mut words = Vec::with_capacity(depth);
        for i in 0..depth as u32 {
            self.write_pod_reg(hub, pod, POD_REG_RAM_PTR, i).await?;
            words.push(self.read_pod_reg(hub, pod, POD_REG_RAM_DATA).await?);
        }
        Ok(words)
    }

    /// Download the global LS/HS digital RAM: program the read
    /// pointer/page, then stream `n` words via the bulk burst opcode
    /// (spec §4.2 "RAM read pointer and page").
    pub async fn read_ls_ram(&mut self, n: usize) -> SumpResult<Vec<u32>> {
        self.exec_write(Opcode::WrRamReadPtr, 0).await?;
        self.exec_write(Opcode::WrRamReadPage, 0).await?;
        self.read_bulk(Opcode::RdLsRamBulk, n).await
    }

    pub async fn read_hs_ram(&mut self, n: usize) -> SumpResult<Vec<u32>> {
        self.exec_write(Opcode::WrRamReadPtr, 0).await?;
        self.exec_write(Opcode::WrRamReadPage, 0).await?;
        self.read_bulk(Opcode::RdHsRamBulk, n).await
    }

    /// Download one RLE pod's full register-level page set: `num_pages`
    /// pages of `depth` DWORDs, selecting each page via `WrRamReadPage`
    /// before the per-word `read_pod_ram_page` sweep.
    pub async fn read_pod_ram_pages(&mut self, hub: u8, pod: u8, depth: usize, num_pages: usize) -> SumpResult<Vec<Vec<u32>>> {
        let mut pages = Vec::with_capacity(num_pages);
        for page in 0..num_pages as u32 {
            self.write_pod_reg(hub, pod, POD_REG_RAM_PAGE, page).await?;
            pages.push(self.read_pod_ram_page(hub, pod, depth).await?);
        }
        Ok(pages)
    }

    // ------------------------------------------------------------------
    // Thread pool (1-of-32 ID allocation)
    // ------------------------------------------------------------------

    pub async fn request_thread_id(&mut self) -> SumpResult<u8> {
        if let Some(id) = self.thread_id.take() {
            self.release_thread_id_inner(id).await?;
        }
        loop {
            let ctrl = self.read_ctrl_raw().await?;
            let busy = (ctrl >> 31) & 1 != 0;
            let locked = (ctrl >> 30) & 1 != 0;
            if !busy && !locked {
                self.write_opcode(Opcode::RdThreadPoolSet).await?;
                let bitmap = self.read_data().await?;
                if let Some(id) = first_free_bit(bitmap) {
                    let new_bitmap = bitmap | (1 << id);
                    self.exec_write(Opcode::WrThreadPoolSet, new_bitmap).await?;
                    self.thread_id = Some(id);
                    return Ok(id);
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn release_thread_id_inner(&mut self, id: u8) -> SumpResult<()> {
        self.write_opcode(Opcode::RdThreadPoolSet).await?;
        let bitmap = self.read_data().await?;
        self.exec_write(Opcode::WrThreadPoolSet, bitmap & !(1 << id)).await
    }

    pub async fn release_thread_id(&mut self) -> SumpResult<()> {
        if let Some(id) = self.thread_id.take() {
            self.release_thread_id_inner(id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Thread lock (acquired around every compound operation)
    // ------------------------------------------------------------------

    async fn acquire_lock(&mut self) -> SumpResult<()> {
        let id = self.thread_id.ok_or_else(|| SumpError::TransportAuth {
            message: "no thread id allocated".to_string(),
        })?;
        loop {
            // Crash recovery: clear our own bit before trying to set it.
            self.exec_write(Opcode::WrThreadLockClr, 1 << id).await?;

            let ctrl = self.read_ctrl_raw().await?;
            let lock_held = (ctrl >> 30) & 1 != 0;
            if !lock_held {
                self.exec_write(Opcode::WrThreadLockSet, 1 << id).await?;
                let verify = self.read_ctrl_raw().await?;
                if (verify >> 30) & 1 != 0 {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn release_lock(&mut self) -> SumpResult<()> {
        let id = self.thread_id.ok_or_else(|| SumpError::TransportAuth {
            message: "no thread id allocated".to_string(),
        })?;
        self.exec_write(Opcode::WrThreadLockClr, 1 << id).await
    }

    // ------------------------------------------------------------------
    // Arm sequence (spec §4.2 "Arm sequence")
    // ------------------------------------------------------------------

    /// Runs the whole arm sequence with the per-thread lock held, per
    /// spec §4.2(b): "around every compound operation ... acquire the
    /// per-thread-ID lock bit, perform the operation, then release."
    pub async fn arm(&mut self, plan: &ArmPlan) -> SumpResult<()> {
        self.acquire_lock().await?;
        let result = self.arm_locked(plan).await;
        self.release_lock().await?;
        result
    }

    async fn arm_locked(&mut self, plan: &ArmPlan) -> SumpResult<()> {
        for ((hub, pod), word) in &plan.pod_user_ctrl {
            self.write_pod_reg(*hub, *pod, POD_REG_USER_CTRL, *word).await?;
        }
        for ((hub, pod), mask) in &plan.pod_rle_mask {
            self.write_pod_reg(*hub, *pod, POD_REG_RLE_MASK, *mask).await?;
        }

        self.exec_write(Opcode::WrTrigType, plan.trigger_type).await?;
        if let Some(analog) = &plan.analog_trigger {
            self.exec_write(Opcode::WrTrigAnalogField, analog.packed()).await?;
        } else {
            self.exec_write(Opcode::WrTrigDigField, plan.trigger_digital_field).await?;
        }

        for ((hub, pod), en) in &plan.pod_trigger_enable {
            self.write_pod_reg(*hub, *pod, POD_REG_TRIG_EN, *en).await?;
        }
        for ((hub, pod), cfg) in &plan.pod_trigger_cfg {
            self.write_pod_reg(*hub, *pod, POD_REG_TRIG_CFG, *cfg as u32 | (TRIG_WIDTH_CLOCKS << 8))
                .await?;
        }

        self.write_opcode(Opcode::Reset).await?;
        self.write_opcode(Opcode::Init).await?;
        self.write_opcode(Opcode::Idle).await?;
        self.write_opcode(Opcode::Arm).await?;

        self.poll_until(Duration::from_secs(5), |s| {
            matches!(s, CaptureState::Armed | CaptureState::PreTrigFill)
        })
        .await?;
        Ok(())
    }

    /// Always-safe cancellation: reset then idle.
    pub async fn force_stop(&mut self) -> SumpResult<()> {
        self.write_opcode(Opcode::Reset).await?;
        self.write_opcode(Opcode::Idle).await
    }

    /// Software trigger. Non-self-clearing; caller must `clear_force_trig`.
    pub async fn force_trig(&mut self) -> SumpResult<()> {
        self.exec_write(Opcode::WrForceTrig, 1).await
    }

    pub async fn clear_force_trig(&mut self) -> SumpResult<()> {
        self.exec_write(Opcode::WrForceTrig, 0).await
    }

    pub fn into_session(self) -> TransportSession {
        self.session
    }
}

fn first_free_bit(bitmap: u32) -> Option<u8> {
    (0..32).find(|b| bitmap & (1 << b) == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_priority_acquired_wins() {
        assert_eq!(decode_status(0x0F), CaptureState::Acquired);
    }

    #[test]
    fn status_priority_triggered_over_armed() {
        assert_eq!(decode_status(0x05), CaptureState::Triggered);
    }

    #[test]
    fn status_pretrigfill_when_armed_and_not_pretrig() {
        assert_eq!(decode_status(0x01), CaptureState::PreTrigFill);
    }

    #[test]
    fn status_armed_when_pretrig_bit_set() {
        assert_eq!(decode_status(0x03), CaptureState::Armed);
    }

    #[test]
    fn status_idle_on_zero() {
        assert_eq!(decode_status(0x00), CaptureState::Idle);
    }

    #[test]
    fn status_unknown_preserves_raw_byte() {
        assert_eq!(decode_status(0x10), CaptureState::Unknown(0x10));
    }

    #[test]
    fn analog_trigger_packs_channel_and_code() {
        let spec = AnalogTriggerSpec { channel: 3, code: 0x00ABCDEF };
        assert_eq!(spec.packed(), 0x03ABCDEF);
    }

    #[test]
    fn first_free_bit_finds_lowest_unset() {
        assert_eq!(first_free_bit(0b0000_0101), Some(1));
        assert_eq!(first_free_bit(u32::MAX), None);
    }

    #[test]
    fn bulk_chunk_constant_matches_spec() {
        assert_eq!(BULK_CHUNK_WORDS, 1024);
    }
}
