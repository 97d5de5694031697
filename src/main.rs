use std::env;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;
use std::thread;

use icyplay::config;
use icyplay::logger;
use icyplay::{Player, PlayerItem};

fn usage() -> ! {
    eprintln!("usage: icyplay <config.toml> <stream url>");
    process::exit(1);
}

fn main() {
    let mut args = env::args().skip(1);
    let (config_path, url) = match (args.next(), args.next()) {
        (Some(config_path), Some(url)) => (config_path, url),
        _ => usage(),
    };

    let config = match config::open(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("icyplay: {}: {}", config_path, e);
            process::exit(1);
        }
    };

    if let Err(e) = logger::init(config.log_level.filter()) {
        eprintln!("icyplay: installing logger: {}", e);
        process::exit(1);
    }

    let player = Player::new(PlayerItem::stream(url.clone(), url, None), config);

    let events = player.subscribe();
    thread::spawn(move || {
        for event in events.iter() {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("icyplay: encoding event: {}", e),
            }
        }
    });

    if let Err(e) = player.play() {
        eprintln!("icyplay: {}", e);
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        match line.trim() {
            "play" => {
                if let Err(e) = player.play() {
                    eprintln!("icyplay: {}", e);
                }
            }
            "pause" => player.pause(),
            "stop" => player.stop(),
            "bypass" => {
                let bypassed = player.equalizer().toggle_bypass();
                eprintln!("equalizer {}", if bypassed { "bypassed" } else { "active" });
            }
            "stats" => eprintln!("{:?}", player.stats()),
            "quit" | "exit" => break,
            "" => {}
            other => eprintln!("unknown command {:?} (play, pause, stop, bypass, stats, quit)", other),
        }
    }

    player.stop();
}
