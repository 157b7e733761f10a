use std::time::Duration;

use crate::types::{CgroupUsage, CpuTime, SandboxResult, Si, SiCode};
use crate::wire::{Decoder, Encoder, WireError};

const TAG_OK: u8 = 0;
const TAG_ERROR: u8 = 1;

pub fn encode_response(result: &SandboxResult) -> Result<Vec<u8>, WireError> {
    let mut enc = Encoder::new();
    match result {
        SandboxResult::Ok {
            si,
            cgroup,
            runtime,
        } => {
            enc.u8(TAG_OK);
            enc.i32(si.code.as_raw());
            enc.i32(si.status);
            enc.duration(*runtime);
            enc.u64(cgroup.cpu_time.user.as_micros() as u64);
            enc.u64(cgroup.cpu_time.system.as_micros() as u64);
            enc.u64(cgroup.peak_memory_in_bytes);
        }
        SandboxResult::Error { description } => {
            enc.u8(TAG_ERROR);
            enc.str(description)?;
        }
    }
    enc.finish()
}

pub fn decode_response(body: &[u8]) -> Result<SandboxResult, WireError> {
    let mut dec = Decoder::new(body);
    let result = match dec.u8()? {
        TAG_OK => {
            let raw_code = dec.i32()?;
            let code = SiCode::from_raw(raw_code).ok_or(WireError::InvalidSiCode(raw_code))?;
            let status = dec.i32()?;
            let runtime = dec.duration()?;
            let user = Duration::from_micros(dec.u64()?);
            let system = Duration::from_micros(dec.u64()?);
            SandboxResult::Ok {
                si: Si { code, status },
                cgroup: CgroupUsage {
                    cpu_time: CpuTime { user, system },
                    peak_memory_in_bytes: dec.u64()?,
                },
                runtime,
            }
        }
        TAG_ERROR => SandboxResult::Error {
            description: dec.string()?,
        },
        tag => return Err(WireError::UnknownTag {
            what: "response",
            tag,
        }),
    };
    dec.finish()?;
    Ok(result)
}
