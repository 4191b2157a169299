//! Thin CLI wiring for local exercising of the reactor: loads a config file,
//! builds the software (non-hardware) verbs backend by default, and drives a
//! tiny synthetic signal generator instead of a real UDP multicast receiver.
//! Mirrors the split in the teacher's own `main.rs`: parse args, load config,
//! build the pieces, run them on threads, join.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate spectrum_reader;

use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};

use spectrum_reader::buffer_pool::HeapBufferPool;
use spectrum_reader::config::{self, Config};
use spectrum_reader::consumer::{ChannelConsumer, ConsumerSink};
use spectrum_reader::digest;
use spectrum_reader::message::{ConsumerMessage, DataPathMessage};
use spectrum_reader::rdma::mock::MockVerbs;
#[cfg(feature = "hardware")]
use spectrum_reader::rdma::cm::RdmaSysVerbs;
use spectrum_reader::signal::{NoopFilterDispatch, SignalMsg, SpectrumInfo};
use spectrum_reader::Client;

const CONFIG_PATH_ARG: &str = "PATH";
const ITERATIONS_ARG: &str = "iterations";
const CHANNEL_SIZE_ARG: &str = "channel-size";
const NUM_CHANNELS_ARG: &str = "num-channels";

fn main() {
    pretty_env_logger::init();

    let opts = mk_app().get_matches();
    let config = load_config(opts.value_of(CONFIG_PATH_ARG));
    let iterations: u32 = opts
        .value_of(ITERATIONS_ARG)
        .unwrap()
        .parse()
        .expect("iterations must be a number");
    let per_channel_size: u32 = opts
        .value_of(CHANNEL_SIZE_ARG)
        .unwrap()
        .parse()
        .expect("channel-size must be a number");
    let num_channels: u32 = opts
        .value_of(NUM_CHANNELS_ARG)
        .unwrap()
        .parse()
        .expect("num-channels must be a number");

    let (sink, rx) = ChannelConsumer::new(256);
    let sink: Arc<dyn ConsumerSink> = Arc::new(sink);
    let dispatch = NoopFilterDispatch::new(vec![sink]);

    let pool = HeapBufferPool::new(vec![(num_channels * per_channel_size) as usize], 64);

    #[cfg(feature = "hardware")]
    let client = {
        let verbs = RdmaSysVerbs::new().expect("failed to open RDMA device");
        Client::open(verbs, pool, config).expect("reactor failed to start")
    };
    #[cfg(not(feature = "hardware"))]
    let client = Client::open(MockVerbs::new(), pool, config).expect("reactor failed to start");

    let server_addr = "127.0.0.1:18515".parse().expect("static address");
    let consumer_thread = thread::spawn(move || {
        let mut delivered = 0u32;
        loop {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(ConsumerMessage::ValidBuffer { data_info, .. }) => {
                    delivered += 1;
                    info!("delivered buffer #{} for {}", delivered, data_info.server_addr);
                }
                Ok(ConsumerMessage::End(result)) => {
                    info!("reactor finished: {:?}", result.code);
                    break;
                }
                Ok(other) => warn!("non-data message: {:?}", std::mem::discriminant(&other)),
                Err(_) => {
                    warn!("no message from the reactor within the timeout, giving up");
                    break;
                }
            }
        }
    });

    for i in 0..iterations {
        let payload = vec![i as u8; (num_channels * per_channel_size) as usize];
        let spectrum = SpectrumInfo {
            server_addr,
            data_addr: 0x1000 + u64::from(i) * u64::from(per_channel_size * num_channels),
            num_channels,
            per_channel_size,
            expected_digest: digest::compute(&payload),
        };
        let signal: SignalMsg = dispatch.dispatch(vec![spectrum]);
        client.send(DataPathMessage::SignalMsg(signal));
        thread::sleep(Duration::from_millis(50));
    }

    client.quit();
    consumer_thread.join().expect("consumer thread panicked");
}

fn load_config(path: Option<&str>) -> Config {
    match path {
        Some(path) => {
            let mut text = String::new();
            fs::File::open(path)
                .unwrap_or_else(|e| panic!("could not open {}: {}", path, e))
                .read_to_string(&mut text)
                .expect("could not read config file");
            config::from_str(&text).expect("configuration error")
        }
        None => Config::default(),
    }
}

fn mk_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::with_name(CONFIG_PATH_ARG)
                .long("config")
                .takes_value(true)
                .help("Config file path (JSON or YAML). Defaults built in if omitted."),
        )
        .arg(
            Arg::with_name(ITERATIONS_ARG)
                .long("iterations")
                .takes_value(true)
                .default_value("20")
                .help("Number of synthetic spectrum advertisements to send."),
        )
        .arg(
            Arg::with_name(CHANNEL_SIZE_ARG)
                .long("channel-size")
                .takes_value(true)
                .default_value("16")
                .help("Bytes per channel in each synthetic spectrum."),
        )
        .arg(
            Arg::with_name(NUM_CHANNELS_ARG)
                .long("num-channels")
                .takes_value(true)
                .default_value("4")
                .help("Channels per synthetic spectrum."),
        )
}
