use serde::Serialize;

pub const GPU_QUERY_COMMAND: &str = "nvidia-smi --query-gpu=index,name,memory.total,memory.used,utilization.gpu --format=csv,noheader,nounits";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_pct: u32,
}

fn numeric<T: std::str::FromStr + Default>(field: &str) -> T {
    field.trim().parse().unwrap_or_default()
}

/// Parses `nvidia-smi` CSV rows. Names may contain commas, so the index is
/// the first field and the three metrics are the last ones. `[N/A]` metrics
/// read as zero; rows without a numeric index are dropped.
pub fn parse_gpu_csv(text: &str) -> Vec<GpuInfo> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 5 {
                return None;
            }
            let index = fields[0].trim().parse::<u32>().ok()?;
            let n = fields.len();
            let name = fields[1..n - 3].join(",").trim().to_string();
            Some(GpuInfo {
                index,
                name,
                memory_total_mb: numeric(fields[n - 3]),
                memory_used_mb: numeric(fields[n - 2]),
                utilization_pct: numeric(fields[n - 1]),
            })
        })
        .collect()
}
