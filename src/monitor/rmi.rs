//! `Rmi` for the reference monitor: every command is logged with its packed result.

use super::{
    outcome, DataDestroyed, ModelMonitor, RealmCreate, Rmi, RmiResult, RttDestroyed,
};
use crate::realm::{PlatformFeatures, RecEnter, RecExit, RecParams};
use crate::rtt::RttEntryView;
use crate::types::{Ipa, Pa, PsciStatus};
use tracing::debug;

fn traced<T>(command: &'static str, args: std::fmt::Arguments<'_>, result: RmiResult<T>) -> RmiResult<T> {
    let code = outcome(&result);
    match &result {
        Err(err) if err.top.is_some() => debug!(
            command,
            args = %args,
            result = %code,
            packed = format_args!("{:#x}", code.packed()),
            top = format_args!("{:#x}", err.top.unwrap_or_default()),
            "rmi"
        ),
        _ => debug!(
            command,
            args = %args,
            result = %code,
            packed = format_args!("{:#x}", code.packed()),
            "rmi"
        ),
    }
    result
}

impl Rmi for ModelMonitor {
    fn granule_delegate(&mut self, pa: Pa) -> RmiResult<()> {
        let result = self.delegate(pa);
        traced("GRANULE_DELEGATE", format_args!("{:#x}", pa), result)
    }

    fn granule_undelegate(&mut self, pa: Pa) -> RmiResult<()> {
        let result = self.undelegate(pa);
        traced("GRANULE_UNDELEGATE", format_args!("{:#x}", pa), result)
    }

    fn realm_create(&mut self, rd: Pa, create: &RealmCreate) -> RmiResult<()> {
        let result = self.create_realm(rd, create);
        traced(
            "REALM_CREATE",
            format_args!("rd={:#x} s2sz={} rtt={:#x}", rd, create.params.s2sz, create.rtt_base),
            result,
        )
    }

    fn realm_activate(&mut self, rd: Pa) -> RmiResult<()> {
        let result = self.activate_realm(rd);
        traced("REALM_ACTIVATE", format_args!("rd={:#x}", rd), result)
    }

    fn realm_destroy(&mut self, rd: Pa) -> RmiResult<()> {
        let result = self.destroy_realm(rd);
        traced("REALM_DESTROY", format_args!("rd={:#x}", rd), result)
    }

    fn rec_aux_count(&self, rd: Pa) -> RmiResult<usize> {
        let result = self
            .realm(rd)
            .map(|_| self.config.features.rec_aux_count);
        traced("REC_AUX_COUNT", format_args!("rd={:#x}", rd), result)
    }

    fn rec_create(&mut self, rd: Pa, rec: Pa, params: &RecParams) -> RmiResult<()> {
        let result = self.create_rec(rd, rec, params);
        traced(
            "REC_CREATE",
            format_args!("rd={:#x} rec={:#x} mpidr={:#x}", rd, rec, params.mpidr),
            result,
        )
    }

    fn rec_destroy(&mut self, rec: Pa) -> RmiResult<()> {
        let result = self.destroy_rec(rec);
        traced("REC_DESTROY", format_args!("rec={:#x}", rec), result)
    }

    fn rec_enter(&mut self, rec: Pa, enter: &RecEnter) -> RmiResult<RecExit> {
        let result = self.enter_rec(rec, enter);
        traced("REC_ENTER", format_args!("rec={:#x}", rec), result)
    }

    fn psci_complete(&mut self, calling: Pa, target: Pa, status: PsciStatus) -> RmiResult<()> {
        let result = self.complete_psci(calling, target, status);
        traced(
            "PSCI_COMPLETE",
            format_args!("calling={:#x} target={:#x} status={:?}", calling, target, status),
            result,
        )
    }

    fn rtt_create(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8) -> RmiResult<()> {
        let result = self.create_rtt(rd, rtt, ipa, level, 0);
        traced(
            "RTT_CREATE",
            format_args!("rd={:#x} rtt={:#x} ipa={:#x} level={}", rd, rtt, ipa, level),
            result,
        )
    }

    fn rtt_destroy(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<RttDestroyed> {
        let result = self.destroy_rtt(rd, ipa, level, 0);
        traced(
            "RTT_DESTROY",
            format_args!("rd={:#x} ipa={:#x} level={}", rd, ipa, level),
            result,
        )
    }

    fn rtt_fold(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Pa> {
        let result = self.fold_rtt(rd, ipa, level);
        traced(
            "RTT_FOLD",
            format_args!("rd={:#x} ipa={:#x} level={}", rd, ipa, level),
            result,
        )
    }

    fn rtt_read_entry(&self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<RttEntryView> {
        let result = self.read_rtt_entry(rd, ipa, level);
        traced(
            "RTT_READ_ENTRY",
            format_args!("rd={:#x} ipa={:#x} level={}", rd, ipa, level),
            result,
        )
    }

    fn rtt_aux_create(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<()> {
        let result = self.create_aux_rtt(rd, rtt, ipa, level, index);
        traced(
            "RTT_AUX_CREATE",
            format_args!("rd={:#x} rtt={:#x} ipa={:#x} level={} index={}", rd, rtt, ipa, level, index),
            result,
        )
    }

    fn rtt_aux_destroy(&mut self, rd: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<RttDestroyed> {
        let result = self.destroy_aux_rtt(rd, ipa, level, index);
        traced(
            "RTT_AUX_DESTROY",
            format_args!("rd={:#x} ipa={:#x} level={} index={}", rd, ipa, level, index),
            result,
        )
    }

    fn rtt_aux_map_protected(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()> {
        let result = self.aux_map(rd, ipa, index);
        traced(
            "RTT_AUX_MAP_PROTECTED",
            format_args!("rd={:#x} ipa={:#x} index={}", rd, ipa, index),
            result,
        )
    }

    fn rtt_aux_unmap_protected(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()> {
        let result = self.aux_unmap(rd, ipa, index);
        traced(
            "RTT_AUX_UNMAP_PROTECTED",
            format_args!("rd={:#x} ipa={:#x} index={}", rd, ipa, index),
            result,
        )
    }

    fn data_create(&mut self, rd: Pa, data: Pa, ipa: Ipa, src: Pa, measure: bool) -> RmiResult<()> {
        let result = self.create_data(rd, data, ipa, src, measure);
        traced(
            "DATA_CREATE",
            format_args!("rd={:#x} data={:#x} ipa={:#x} src={:#x}", rd, data, ipa, src),
            result,
        )
    }

    fn data_create_unknown(&mut self, rd: Pa, data: Pa, ipa: Ipa) -> RmiResult<()> {
        let result = self.create_data_unknown(rd, data, ipa);
        traced(
            "DATA_CREATE_UNKNOWN",
            format_args!("rd={:#x} data={:#x} ipa={:#x}", rd, data, ipa),
            result,
        )
    }

    fn data_destroy(&mut self, rd: Pa, ipa: Ipa) -> RmiResult<DataDestroyed> {
        let result = self.destroy_data(rd, ipa);
        traced("DATA_DESTROY", format_args!("rd={:#x} ipa={:#x}", rd, ipa), result)
    }

    fn rtt_map_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8, desc: u64) -> RmiResult<()> {
        let result = self.map_unprotected(rd, ipa, level, desc);
        traced(
            "RTT_MAP_UNPROTECTED",
            format_args!("rd={:#x} ipa={:#x} level={} desc={:#x}", rd, ipa, level, desc),
            result,
        )
    }

    fn rtt_unmap_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Ipa> {
        let result = self.unmap_unprotected(rd, ipa, level);
        traced(
            "RTT_UNMAP_UNPROTECTED",
            format_args!("rd={:#x} ipa={:#x} level={}", rd, ipa, level),
            result,
        )
    }

    fn rtt_init_ripas(&mut self, rd: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        let result = self.init_ripas(rd, base, top);
        traced(
            "RTT_INIT_RIPAS",
            format_args!("rd={:#x} base={:#x} top={:#x}", rd, base, top),
            result,
        )
    }

    fn rtt_set_ripas(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        let result = self.set_ripas(rd, rec, base, top);
        traced(
            "RTT_SET_RIPAS",
            format_args!("rd={:#x} rec={:#x} base={:#x} top={:#x}", rd, rec, base, top),
            result,
        )
    }

    fn rtt_set_s2ap(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        let result = self.set_s2ap(rd, rec, base, top);
        traced(
            "RTT_SET_S2AP",
            format_args!("rd={:#x} rec={:#x} base={:#x} top={:#x}", rd, rec, base, top),
            result,
        )
    }

    fn features(&self) -> PlatformFeatures {
        self.config.features.clone()
    }
}
