//! Parser for `nvidia-smi -L`.
//!
//! ```text
//! GPU 0: NVIDIA A100-SXM4-40GB (UUID: GPU-5d5ba0d6-d33d-2b2c-524d-9e3d8d2b8a77)
//!   MIG 1g.5gb      Device  0: (UUID: MIG-1a2b3c4d-0000-5555-aaaa-000000000001)
//! ```

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmiMig {
    pub position: u32,
    pub profile: String,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmiGpu {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub instances: Vec<SmiMig>,
}

fn between<'a>(line: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = line.find(start)? + start.len();
    let to = from + line[from..].find(end)?;
    Some(&line[from..to])
}

fn parse_gpu(line: &str) -> Option<SmiGpu> {
    let index = between(line, "GPU ", ":")?.trim().parse().ok()?;
    let name = between(line, ": ", " (UUID:")?.trim().to_string();
    let uuid = between(line, "(UUID: ", ")")?.trim().to_string();
    Some(SmiGpu {
        index,
        name,
        uuid,
        instances: Vec::new(),
    })
}

fn parse_mig(line: &str) -> Option<SmiMig> {
    let profile = line.split_whitespace().nth(1)?.to_string();
    let position = between(line, "Device", ":")?.trim().parse().ok()?;
    let uuid = between(line, "(UUID: ", ")")?.trim().to_string();
    Some(SmiMig {
        position,
        profile,
        uuid,
    })
}

/// Lines that match neither form are skipped.
pub fn parse_listing(text: &str) -> Vec<SmiGpu> {
    let mut gpus: Vec<SmiGpu> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("GPU ") {
            match parse_gpu(line) {
                Some(gpu) => gpus.push(gpu),
                None => tracing::debug!(line, "Skipping unparsable GPU line"),
            }
        } else if line.starts_with("MIG ") {
            match (parse_mig(line), gpus.last_mut()) {
                (Some(mig), Some(gpu)) => gpu.instances.push(mig),
                _ => tracing::debug!(line, "Skipping unparsable MIG line"),
            }
        }
    }
    gpus
}
