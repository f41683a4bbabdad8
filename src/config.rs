//! Configuration and command-line argument parsing.

use std::env;

use crate::network::CidrRule;

#[derive(Debug, Clone)]
pub struct Config {
    // Input.
    pub infile: Option<String>,
    /// File replay count; 0 replays forever.
    pub loops: u64,

    // Tuner.
    pub freq: u32,
    /// None selects automatic gain.
    pub gain: Option<f64>,
    pub ppm: i32,

    // Decoding.
    pub fix_errors: bool,
    pub aggressive: bool,
    pub preamble_threshold: u32,

    // Output.
    pub raw: bool,
    pub onlyaddr: bool,
    pub metric: bool,
    pub interactive: bool,
    pub interactive_rows: usize,
    pub interactive_ttl: u64,

    // Receiver position.
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,

    // Networking.
    pub net: bool,
    pub net_only: bool,
    pub net_active: bool,
    pub net_ro_port: u16,
    pub net_ri_port: u16,
    pub net_sbs_port: u16,
    pub net_http_port: u16,
    pub host_raw_in: Option<String>,
    pub host_sbs_in: Option<String>,
    pub deny_rules: Vec<CidrRule>,

    // HTTP.
    pub web_root: String,
    pub web_page: String,
    pub json_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            infile: None,
            loops: 1,
            freq: 1_090_000_000,
            gain: None,
            ppm: 0,
            fix_errors: true,
            aggressive: false,
            preamble_threshold: 58,
            raw: false,
            onlyaddr: false,
            metric: false,
            interactive: false,
            interactive_rows: 15,
            interactive_ttl: 60,
            home_lat: None,
            home_lon: None,
            net: false,
            net_only: false,
            net_active: false,
            net_ro_port: 30002,
            net_ri_port: 30001,
            net_sbs_port: 30003,
            net_http_port: 8080,
            host_raw_in: None,
            host_sbs_in: None,
            deny_rules: Vec::new(),
            web_root: "web".to_string(),
            web_page: "gmap.html".to_string(),
            json_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Parse the process arguments. Usage errors print one line to
    /// stderr and exit with code 1.
    pub fn from_args() -> Self {
        let args: Vec<String> = env::args().skip(1).collect();
        match Self::parse(&args) {
            Ok(config) => config,
            Err(message) => {
                eprintln!("{}", message);
                std::process::exit(1);
            }
        }
    }

    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut config = Config::default();

        fn value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
            *i += 1;
            args.get(*i)
                .map(|s| s.as_str())
                .ok_or_else(|| format!("{} requires a value", name))
        }

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--infile" => config.infile = Some(value(args, &mut i, "--infile")?.to_string()),
                "--loops" => config.loops = parse_num(value(args, &mut i, "--loops")?, "--loops")?,
                "--freq" => config.freq = parse_num(value(args, &mut i, "--freq")?, "--freq")?,
                "--gain" => {
                    let v = value(args, &mut i, "--gain")?;
                    config.gain = if v == "auto" {
                        None
                    } else {
                        Some(parse_num::<f64>(v, "--gain")?)
                    };
                }
                "--ppm" => config.ppm = parse_num(value(args, &mut i, "--ppm")?, "--ppm")?,
                "--no-fix" => config.fix_errors = false,
                "--aggressive" => config.aggressive = true,
                "--preamble-threshold" => {
                    config.preamble_threshold = parse_num(
                        value(args, &mut i, "--preamble-threshold")?,
                        "--preamble-threshold",
                    )?
                }
                "--raw" => config.raw = true,
                "--onlyaddr" => config.onlyaddr = true,
                "--metric" => config.metric = true,
                "--interactive" => config.interactive = true,
                "--interactive-ttl" => {
                    config.interactive_ttl =
                        parse_num(value(args, &mut i, "--interactive-ttl")?, "--interactive-ttl")?
                }
                "--lat" => config.home_lat = Some(parse_num(value(args, &mut i, "--lat")?, "--lat")?),
                "--lon" => config.home_lon = Some(parse_num(value(args, &mut i, "--lon")?, "--lon")?),
                "--net" => config.net = true,
                "--net-only" => {
                    config.net = true;
                    config.net_only = true;
                }
                "--net-active" => {
                    config.net = true;
                    config.net_active = true;
                }
                "--net-ro-port" => {
                    config.net_ro_port =
                        parse_num(value(args, &mut i, "--net-ro-port")?, "--net-ro-port")?
                }
                "--net-ri-port" => {
                    config.net_ri_port =
                        parse_num(value(args, &mut i, "--net-ri-port")?, "--net-ri-port")?
                }
                "--net-sbs-port" => {
                    config.net_sbs_port =
                        parse_num(value(args, &mut i, "--net-sbs-port")?, "--net-sbs-port")?
                }
                "--net-http-port" => {
                    config.net_http_port =
                        parse_num(value(args, &mut i, "--net-http-port")?, "--net-http-port")?
                }
                "--host-raw-in" => {
                    config.host_raw_in = Some(value(args, &mut i, "--host-raw-in")?.to_string())
                }
                "--host-sbs-in" => {
                    config.host_sbs_in = Some(value(args, &mut i, "--host-sbs-in")?.to_string())
                }
                "--deny4" | "--deny6" => {
                    let v = value(args, &mut i, "--deny4/--deny6")?;
                    let rule = CidrRule::parse(v)
                        .ok_or_else(|| format!("invalid CIDR deny rule: {}", v))?;
                    config.deny_rules.push(rule);
                }
                "--web-root" => config.web_root = value(args, &mut i, "--web-root")?.to_string(),
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => return Err(format!("unknown option: {} (try --help)", other)),
            }
            i += 1;
        }

        if config.net_active && config.host_raw_in.is_none() && config.host_sbs_in.is_none() {
            return Err("--net-active needs --host-raw-in or --host-sbs-in".to_string());
        }

        Ok(config)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {}: {}", name, value))
}

fn print_help() {
    println!(
        r#"rx1090 - Mode S / ADS-B receiver

Usage: rx1090 [OPTIONS]

Input:
  --infile <path>           Read 8-bit IQ samples from a file ('-' = stdin)
  --loops <N>               Replay the file N times (0 = forever)
  --freq <hz>               Tuner frequency (default 1090000000)
  --gain <db|auto>          Tuner gain in dB, or automatic
  --ppm <n>                 Tuner frequency correction

Decoding:
  --no-fix                  Disable single-bit error correction
  --aggressive              Also try two-bit correction on DF17 (more CPU)
  --preamble-threshold <n>  Preamble detector sensitivity (default 58)

Display:
  --interactive             Full-screen live aircraft table
  --interactive-ttl <s>     Drop aircraft after <s> silent seconds (default 60)
  --raw                     Print frames as raw hex only
  --onlyaddr                Print ICAO addresses only
  --metric                  Metric units in the table
  --lat <deg> --lon <deg>   Receiver position for distances

Networking:
  --net                     Enable network services
  --net-only                Network services without an SDR or file
  --net-active              Connect out to feeders instead of listening
  --net-ro-port <port>      Raw output port        (default 30002)
  --net-ri-port <port>      Raw input port         (default 30001)
  --net-sbs-port <port>     SBS output port        (default 30003)
  --net-http-port <port>    HTTP port              (default 8080)
  --host-raw-in <host:port> Upstream raw feeder (--net-active)
  --host-sbs-in <host:port> Upstream SBS feeder (--net-active)
  --deny4 <cidr>            Deny IPv4 clients matching a CIDR (repeatable)
  --deny6 <cidr>            Deny IPv6 clients matching a CIDR (repeatable)
  --web-root <dir>          Static file directory (default ./web)

  --help                    This text
"#
    );
}
