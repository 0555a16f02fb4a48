//! Benchmarks for artifact transport operations (upload/download).
//!
//! These benchmarks measure the transfer rate of CAS upload/download across
//! different data sizes against a running coordinator.
//!
//! ## Setup
//!
//! These benchmarks require a running coordinator. Set the server URL using
//! the `POLYBUILD_COORDINATOR_URL` environment variable:
//!
//! ```bash
//! export POLYBUILD_COORDINATOR_URL=http://localhost:3000
//! cargo bench --package polybuild-coordinator
//! ```

use polybuild_wire::artifact::ArtifactId;
use rand::RngCore;
use std::env;
use url::Url;

const KB: usize = 1_024;
const MB: usize = 1_048_576;
const GB: usize = 1_073_741_824;

const SIZES: &[usize] = &[KB, 10 * KB, 100 * KB, MB, 10 * MB, 50 * MB, 100 * MB, GB];

fn main() {
    divan::main();
}

/// Get the coordinator URL from environment or panic with a helpful message.
fn coordinator_url() -> Url {
    env::var("POLYBUILD_COORDINATOR_URL")
        .expect("POLYBUILD_COORDINATOR_URL must be set to run benchmarks")
        .parse()
        .expect("POLYBUILD_COORDINATOR_URL must be a valid URL")
}

/// Test data generator for CAS benchmarks.
mod helpers {
    use super::*;

    /// Generate random test data of the specified size, along with the
    /// content-addressed id it will be stored under.
    pub fn generate_test_data(size: usize) -> (ArtifactId, Vec<u8>) {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);
        let id = ArtifactId::from_buffer(&data);
        (id, data)
    }
}

mod upload {
    use super::*;

    #[divan::bench(args = SIZES, sample_count = 5)]
    fn bytes(bencher: divan::Bencher, size: usize) {
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let client = reqwest::Client::new();
        let base = coordinator_url();

        bencher
            .with_inputs(|| helpers::generate_test_data(size))
            .bench_values(|(id, data)| {
                runtime.block_on(async {
                    let url = base.join(&format!("api/v1/cas/{id}")).expect("join url");
                    client
                        .put(url)
                        .body(data)
                        .send()
                        .await
                        .expect("upload")
                        .error_for_status()
                        .expect("upload status");
                });
            });
    }
}

mod download {
    use super::*;

    #[divan::bench(args = SIZES, sample_count = 5)]
    fn bytes(bencher: divan::Bencher, size: usize) {
        let runtime = tokio::runtime::Runtime::new().expect("create runtime");
        let client = reqwest::Client::new();
        let base = coordinator_url();

        bencher
            .with_inputs(|| {
                let (id, data) = helpers::generate_test_data(size);
                runtime.block_on(async {
                    let url = base.join(&format!("api/v1/cas/{id}")).expect("join url");
                    client
                        .put(url)
                        .body(data)
                        .send()
                        .await
                        .expect("pre-upload")
                        .error_for_status()
                        .expect("pre-upload status");
                });
                id
            })
            .bench_values(|id| {
                runtime.block_on(async {
                    let url = base.join(&format!("api/v1/cas/{id}")).expect("join url");
                    client
                        .get(url)
                        .send()
                        .await
                        .expect("download")
                        .bytes()
                        .await
                        .expect("read body");
                });
            });
    }
}
