use cxo_codec::{CodecError, CodecResult, Decode, Decoder, Encode, Encoder};

use crate::object::Change;

/// Object counts and volumes, split into all and used (rc > 0).
///
/// Invariants: `amount_used <= amount_all`, `volume_used <= volume_all`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub amount_all: u64,
    pub amount_used: u64,
    pub volume_all: u64,
    pub volume_used: u64,
}

impl Stat {
    /// Account for one mutation acknowledged by the backend.
    pub fn apply(&mut self, change: &Change) {
        match *change {
            Change::None => {}
            Change::Created { vol, rc } => {
                self.amount_all += 1;
                self.volume_all += vol;
                if rc > 0 {
                    self.amount_used += 1;
                    self.volume_used += vol;
                }
            }
            Change::Deleted { vol, rc } => {
                self.amount_all = self.amount_all.saturating_sub(1);
                self.volume_all = self.volume_all.saturating_sub(vol);
                if rc > 0 {
                    self.amount_used = self.amount_used.saturating_sub(1);
                    self.volume_used = self.volume_used.saturating_sub(vol);
                }
            }
            Change::Updated {
                old: (old_vol, old_rc),
                new: (new_vol, new_rc),
            } => {
                self.volume_all = (self.volume_all + new_vol).saturating_sub(old_vol);
                match (old_rc > 0, new_rc > 0) {
                    // resurrected
                    (false, true) => {
                        self.amount_used += 1;
                        self.volume_used += new_vol;
                    }
                    // killed
                    (true, false) => {
                        self.amount_used = self.amount_used.saturating_sub(1);
                        self.volume_used = self.volume_used.saturating_sub(old_vol);
                    }
                    (true, true) => {
                        self.volume_used = (self.volume_used + new_vol).saturating_sub(old_vol);
                    }
                    (false, false) => {}
                }
            }
        }
    }

    /// Count one stored record during a full recount.
    pub(crate) fn count(&mut self, vol: u64, rc: i64) {
        self.apply(&Change::Created { vol, rc });
    }
}

const FLAG_OPEN: u8 = 0x00;
const FLAG_SAFE_CLOSED: u8 = 0xff;

/// Persisted statistics plus the safe-close flag.
///
/// Layout: four little-endian i64 counters followed by one flag byte
/// (`0x00` open, `0xff` safely closed), 33 bytes in total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub stat: Stat,
    pub safe_closed: bool,
}

impl MetaInfo {
    pub const ENCODED_LEN: usize = 33;
}

impl Encode for MetaInfo {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_i64(self.stat.amount_all as i64)
            .put_i64(self.stat.amount_used as i64)
            .put_i64(self.stat.volume_all as i64)
            .put_i64(self.stat.volume_used as i64)
            .put_u8(if self.safe_closed {
                FLAG_SAFE_CLOSED
            } else {
                FLAG_OPEN
            });
    }
}

impl Decode for MetaInfo {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        if dec.remaining() != Self::ENCODED_LEN {
            return Err(CodecError::InvalidSize(format!(
                "meta record is {} bytes, want {}",
                dec.remaining(),
                Self::ENCODED_LEN
            )));
        }
        let counter = |dec: &mut Decoder<'_>, field: &'static str| -> CodecResult<u64> {
            let v = dec.get_i64()?;
            u64::try_from(v).map_err(|_| CodecError::InvalidField {
                field,
                reason: format!("negative counter {v}"),
            })
        };
        let stat = Stat {
            amount_all: counter(dec, "amount_all")?,
            amount_used: counter(dec, "amount_used")?,
            volume_all: counter(dec, "volume_all")?,
            volume_used: counter(dec, "volume_used")?,
        };
        let safe_closed = match dec.get_u8()? {
            FLAG_OPEN => false,
            FLAG_SAFE_CLOSED => true,
            other => {
                return Err(CodecError::InvalidField {
                    field: "safe_closed",
                    reason: format!("unexpected flag {other:#04x}"),
                })
            }
        };
        Ok(Self { stat, safe_closed })
    }
}
