use super::*;
use std::path::Path;
use tempfile::TempDir;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

#[test]
fn global_flags_parse_after_subcommand() {
    let args = parse_args(&["mcp-hub", "tools", "--config", "/tmp/hub.toml", "--log", "hub.log"]);
    assert!(matches!(args.command, Commands::Tools));
    assert_eq!(args.config.as_deref(), Some(Path::new("/tmp/hub.toml")));
    assert_eq!(args.log.as_deref(), Some(Path::new("hub.log")));
}

#[test]
fn serve_accepts_a_token_flag() {
    let args = parse_args(&["mcp-hub", "serve", "--token", "abc"]);
    match args.command {
        Commands::Serve { token } => assert_eq!(token.as_deref(), Some("abc")),
        _ => panic!("expected serve"),
    }
}

#[test]
fn server_add_keeps_hyphenated_arguments() {
    let args = parse_args(&[
        "mcp-hub",
        "server",
        "add",
        "fs",
        "--env",
        "ROOT=/srv",
        "npx",
        "-y",
        "@modelcontextprotocol/server-filesystem",
        "/tmp",
    ]);
    let Commands::Server {
        command:
            ServerCommands::Add {
                name,
                env,
                cwd,
                disabled,
                command,
                args,
            },
    } = args.command
    else {
        panic!("expected server add");
    };
    assert_eq!(name, "fs");
    assert_eq!(env, vec![("ROOT".to_string(), "/srv".to_string())]);
    assert!(cwd.is_none());
    assert!(!disabled);
    assert_eq!(command, "npx");
    assert_eq!(
        args,
        vec!["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
    );
}

#[test]
fn bad_env_pairs_are_rejected() {
    assert!(Args::try_parse_from(["mcp-hub", "server", "add", "fs", "--env", "NOPE", "cmd"]).is_err());
    assert!(servers::parse_env_pair("=value").is_err());
    assert_eq!(
        servers::parse_env_pair("A=b=c").expect("pair"),
        ("A".to_string(), "b=c".to_string())
    );
}

#[test]
fn server_add_and_remove_round_trip_through_the_config_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("config.toml");

    let entry = servers::entry_from_args(
        "fs".into(),
        "mcp-fs".into(),
        vec!["--root".into(), "/srv".into()],
        vec![("TOKEN".into(), "x".into())],
        None,
        false,
    );
    servers::add_server(&path, entry.clone()).expect("add");
    assert!(servers::add_server(&path, entry).is_err());

    let config = Config::load_from_path(&path).expect("load");
    let saved = config.find_server("fs").expect("saved entry");
    assert_eq!(saved.args, vec!["--root", "/srv"]);
    assert_eq!(saved.env.get("TOKEN").map(String::as_str), Some("x"));
    assert!(saved.enabled);

    servers::list_servers(&path).expect("list");
    servers::remove_server(&path, "fs").expect("remove");
    assert!(servers::remove_server(&path, "fs").is_err());
    assert!(Config::load_from_path(&path).expect("load").servers.is_empty());
}

#[test]
fn bridge_command_prefers_configured_host() {
    let mut config = Config::default();
    config.bridge.host_command = Some(vec!["/opt/hub".into(), "bridge-host".into()]);
    assert_eq!(
        serve::bridge_command(&config).expect("command"),
        vec!["/opt/hub", "bridge-host"]
    );

    config.bridge.host_command = Some(Vec::new());
    let fallback = serve::bridge_command(&config).expect("command");
    assert_eq!(fallback.last().map(String::as_str), Some("bridge-host"));
}
