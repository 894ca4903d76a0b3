use tabled::Tabled;

#[derive(Tabled)]
pub struct QueryRow {
    pub store_variant: String,
    pub query: String,
    pub iterations: usize,
    #[tabled(display = "float2")]
    pub mean_ms: f64,
    #[tabled(display = "float2")]
    pub p50_ms: f64,
    #[tabled(display = "float2")]
    pub p95_ms: f64,
    #[tabled(display = "float2")]
    pub min_ms: f64,
    #[tabled(display = "float2")]
    pub max_ms: f64,
    #[tabled(display = "float2", rename = "throughput (/s)")]
    pub throughput: f64,
}

fn float2(n: &f64) -> String {
    format!("{:.2}", n)
}
