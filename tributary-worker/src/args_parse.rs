use anyhow::Result;
use std::env;

pub(crate) struct Args {
    pub(crate) config_file: String,
    pub(crate) broker_addr: Option<String>,
    pub(crate) member_name: Option<String>,
    pub(crate) queue_group: Option<String>,
}

impl Args {
    fn show_usage() {
        println!("Tributary Worker Usage:");
        println!("  --config-file        Path to config file (required)");
        println!("  --broker-addr        Broker address, overrides the config file list");
        println!("  --member-name        Queue-group member name for this instance");
        println!("  --queue-group        Queue group to join (overrides config)");
    }
    pub(crate) fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().collect();

        if args.len() <= 1 {
            Self::show_usage();
            return Err(anyhow::anyhow!("No arguments provided"));
        }

        let mut config_file = None;
        let mut broker_addr = None;
        let mut member_name = None;
        let mut queue_group = None;

        let mut args_iter = args.iter().skip(1);
        while let Some(arg) = args_iter.next() {
            match arg.as_str() {
                "--config-file" => {
                    config_file = args_iter.next().map(|s| s.to_string());
                }
                "--broker-addr" => {
                    broker_addr = args_iter.next().map(|s| s.to_string());
                }
                "--member-name" => {
                    member_name = args_iter.next().map(|s| s.to_string());
                }
                "--queue-group" => {
                    queue_group = args_iter.next().map(|s| s.to_string());
                }
                _ => return Err(anyhow::anyhow!("Unknown argument: {}", arg)),
            }
        }

        Ok(Args {
            config_file: config_file
                .ok_or_else(|| anyhow::anyhow!("Missing required --config-file"))?,
            broker_addr,
            member_name,
            queue_group,
        })
    }
}
