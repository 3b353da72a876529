//! Topology Discovery (spec §4.3): enumerate hubs/pods over the device
//! driver, build the name-resolution dictionary used to rewrite textual
//! signal sources into indexed `digital_rle[h][p][...]` form.

use std::collections::HashMap;

use crate::driver::{DeviceDriver, Opcode, POD_REG_HW_CFG, POD_REG_RAM_CFG, POD_REG_TRIGGERABLE, POD_REG_TRIG_LATENCY};
use crate::error::SumpResult;

/// Fixed-point u12.20 MHz clock frequency, as read from hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockFreq(pub u32);

impl ClockFreq {
    pub fn mhz(self) -> f64 {
        (self.0 as f64) / (1u64 << 20) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoromGranularity {
    Bit,
    Byte,
    Word,
    Dword,
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub index: u8,
    pub name: Option<String>,
    pub instance: Option<u32>,
    pub hw_rev: u8,
    pub addr_bits: u8,
    pub data_bits: u16,
    pub ts_bits: u8,
    pub view_rom_present: bool,
    pub pod_name_enable: bool,
    pub mask_bits_present: bool,
    pub norom_granularity: Option<NoromGranularity>,
    pub triggerable_mask: u32,
    pub trig_latency_core_clocks: u32,
    pub trig_latency_miso_clocks: u32,
    pub trig_latency_mosi_clocks: u32,
}

impl Pod {
    pub fn ram_depth(&self) -> u32 {
        1u32 << self.addr_bits
    }
}

#[derive(Debug, Clone)]
pub struct Hub {
    pub index: u8,
    pub name: Option<String>,
    pub clock: ClockFreq,
    pub pods: Vec<Pod>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub hubs: Vec<Hub>,
}

impl Topology {
    /// Build the "hub_name.pod_name"[.instance] -> (hub_index, pod_index)
    /// dictionary used to rewrite textual signal sources (spec §4.3).
    pub fn name_dict(&self) -> HashMap<String, (u8, u8)> {
        let mut dict = HashMap::new();
        for hub in &self.hubs {
            let Some(hub_name) = &hub.name else { continue };
            for pod in &hub.pods {
                let Some(pod_name) = &pod.name else { continue };
                let key = format!("{hub_name}.{pod_name}");
                dict.insert(key.clone(), (hub.index, pod.index));
                if let Some(instance) = pod.instance {
                    dict.insert(format!("{key}.{instance}"), (hub.index, pod.index));
                }
            }
        }
        dict
    }

    pub fn pod(&self, hub: u8, pod: u8) -> Option<&Pod> {
        self.hubs
            .iter()
            .find(|h| h.index == hub)
            .and_then(|h| h.pods.iter().find(|p| p.index == pod))
    }
}

fn decode_norom_granularity(hw_cfg: u32) -> Option<NoromGranularity> {
    if hw_cfg & 0x0800 != 0 {
        Some(NoromGranularity::Dword)
    } else if hw_cfg & 0x0400 != 0 {
        Some(NoromGranularity::Word)
    } else if hw_cfg & 0x0200 != 0 {
        Some(NoromGranularity::Byte)
    } else if hw_cfg & 0x0100 != 0 {
        Some(NoromGranularity::Bit)
    } else {
        None
    }
}

/// Enumerate all hubs and pods over the driver (spec §4.3 "Enumeration").
pub async fn discover(driver: &mut DeviceDriver) -> SumpResult<Topology> {
    let hub_count = driver.exec_hub_count().await?;
    let mut hubs = Vec::with_capacity(hub_count as usize);

    for hub_idx in 0..hub_count {
        let freq_raw = driver.hub_freq(hub_idx).await?;
        let name = driver.read_hub_name(hub_idx).await?;
        let name = if name.is_empty() { None } else { Some(name) };
        let pod_count = driver.pod_count(hub_idx).await?;

        let mut pods = Vec::with_capacity(pod_count as usize);
        for pod_idx in 0..pod_count {
            let hw_cfg = driver.pod_reg(hub_idx, pod_idx, POD_REG_HW_CFG).await?;
            let ram_cfg = driver.pod_reg(hub_idx, pod_idx, POD_REG_RAM_CFG).await?;
            let triggerable = driver.pod_reg(hub_idx, pod_idx, POD_REG_TRIGGERABLE).await?;
            let latency = driver.pod_reg(hub_idx, pod_idx, POD_REG_TRIG_LATENCY).await?;

            let pod_name = driver.read_pod_name(hub_idx, pod_idx).await?;
            let pod_name = if pod_name.is_empty() { None } else { Some(pod_name) };
            let instance = driver.pod_reg(hub_idx, pod_idx, crate::driver::POD_REG_INSTANCE).await.ok();

            pods.push(Pod {
                index: pod_idx,
                name: pod_name,
                instance,
                hw_rev: ((hw_cfg >> 24) & 0xFF) as u8,
                addr_bits: (ram_cfg & 0xFF) as u8,
                data_bits: ((ram_cfg >> 8) & 0xFFFF) as u16,
                ts_bits: ((ram_cfg >> 24) & 0xFF) as u8,
                view_rom_present: hw_cfg & 0x02 != 0,
                pod_name_enable: hw_cfg & 0x01 != 0,
                mask_bits_present: hw_cfg & 0x08 != 0,
                norom_granularity: decode_norom_granularity(hw_cfg),
                triggerable_mask: triggerable,
                trig_latency_core_clocks: latency & 0xFF,
                trig_latency_miso_clocks: (latency >> 8) & 0xFF,
                trig_latency_mosi_clocks: (latency >> 16) & 0xFF,
            });
        }

        hubs.push(Hub {
            index: hub_idx,
            name,
            clock: ClockFreq(freq_raw),
            pods,
        });
    }

    Ok(Topology { hubs })
}

impl DeviceDriver {
    async fn exec_hub_count(&mut self) -> SumpResult<u8> {
        // The hw-id readback word packs [15:8] = hub_count alongside the
        // [7:0] hw_id byte checked by `require_hardware` (spec §4.3
        // "Read hub count from config").
        let v = self.exec_read(Opcode::RdHwId, None).await?;
        Ok(((v >> 8) & 0xFF) as u8)
    }

    async fn hub_freq(&mut self, hub: u8) -> SumpResult<u32> {
        let addr = (hub as u32) << 16;
        self.exec_read(Opcode::RdHubFreq, Some(addr)).await
    }

    async fn pod_count(&mut self, hub: u8) -> SumpResult<u8> {
        let addr = (hub as u32) << 16;
        Ok((self.exec_read(Opcode::RdPodCount, Some(addr)).await? & 0xFF) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_freq_converts_u12_20_fixed_point() {
        // 100.0 MHz == 100 << 20
        let freq = ClockFreq(100u32 << 20);
        assert!((freq.mhz() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn norom_granularity_priority_is_dword_first() {
        // Both dword and bit bits set: dword wins (matches
        // `Model::generate_norom_signals`'s granularity priority order).
        assert_eq!(decode_norom_granularity(0x0900), Some(NoromGranularity::Dword));
        assert_eq!(decode_norom_granularity(0x0100), Some(NoromGranularity::Bit));
        assert_eq!(decode_norom_granularity(0x0000), None);
    }

    #[test]
    fn name_dict_keys_include_instance_suffix() {
        let topo = Topology {
            hubs: vec![Hub {
                index: 0,
                name: Some("core".to_string()),
                clock: ClockFreq(0),
                pods: vec![Pod {
                    index: 2,
                    name: Some("gen".to_string()),
                    instance: Some(3),
                    hw_rev: 0,
                    addr_bits: 0,
                    data_bits: 0,
                    ts_bits: 0,
                    view_rom_present: false,
                    pod_name_enable: true,
                    mask_bits_present: false,
                    norom_granularity: None,
                    triggerable_mask: 0,
                    trig_latency_core_clocks: 0,
                    trig_latency_miso_clocks: 0,
                    trig_latency_mosi_clocks: 0,
                }],
            }],
        };
        let dict = topo.name_dict();
        assert_eq!(dict.get("core.gen"), Some(&(0, 2)));
        assert_eq!(dict.get("core.gen.3"), Some(&(0, 2)));
    }
}
