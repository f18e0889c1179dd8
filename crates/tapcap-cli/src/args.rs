//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand, ValueEnum};

/// UI interaction ground-truth collector for Android devices.
///
/// Records control-to-effect transitions: which control was touched, what
/// the screen looked like before, and what it became afterwards. Each
/// record pairs hierarchy dumps, screenshots, and an annotated screenshot
/// with an append-only JSON ledger.
#[derive(Debug, Parser)]
#[command(name = "tapcap", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Drive one action on the device and record the transition
    #[command(after_help = "\
Examples:
  tapcap capture click --bounds '[100,200][300,260]'   # Tap a control by exact bounds
  tapcap capture click --xpath '//node[@text=\"OK\"]'    # Tap a control by path query
  tapcap capture long-click --bounds '[0,0][96,96]' --duration 1200
  tapcap capture swipe --xpath '//node[1]' --direction up --distance 400
  tapcap capture swipe --bounds '[0,0][1080,1920]' --dx 0 --dy -500 --mid-capture
  tapcap capture text --xpath '//node[@class=\"android.widget.EditText\"]' --text 'hello'
  tapcap capture back                                  # Hardware back, no target needed")]
    Capture(CaptureArgs),

    /// Record the current screen as a terminal state, without acting
    FinalSnapshot,

    /// Report daemon, device, and ledger status
    Health,

    /// Watch physical touches on the device and record each tap
    #[command(after_help = "\
Streams labeled touch events from the device and records every completed
tap against the screen state the user saw when they touched it. Stop with
Ctrl-C; the last screen is recorded as a final state on the way out.

Examples:
  tapcap listen                          # Autodetect the touchscreen
  tapcap listen --device /dev/input/event4
  tapcap listen --serial emulator-5554 --out ./session1")]
    Listen(ListenArgs),

    /// Start the daemon process (usually auto-started)
    Daemon(DeviceArgs),

    /// Stop the daemon process
    Stop,
}

#[derive(Debug, clap::Args)]
pub struct CaptureArgs {
    /// Action to drive
    #[arg(value_enum)]
    pub action: ActionArg,

    /// Exact bounds string of the target, e.g. '[0,0][96,96]'
    #[arg(long, value_name = "RECT")]
    pub bounds: Option<String>,

    /// Path query for the target, e.g. "//node[@text='OK']"
    #[arg(long, value_name = "QUERY")]
    pub xpath: Option<String>,

    /// Text to type (text action)
    #[arg(long)]
    pub text: Option<String>,

    /// Hold or swipe duration in milliseconds [default: 800]
    #[arg(long, value_name = "MS")]
    pub duration: Option<u64>,

    /// Horizontal swipe delta in pixels
    #[arg(long, allow_hyphen_values = true)]
    pub dx: Option<i32>,

    /// Vertical swipe delta in pixels
    #[arg(long, allow_hyphen_values = true)]
    pub dy: Option<i32>,

    /// Swipe direction: up, down, left, right
    #[arg(long)]
    pub direction: Option<String>,

    /// Swipe distance in pixels
    #[arg(long)]
    pub distance: Option<i32>,

    /// Settle delay before the post-action snapshot [default: 400]
    #[arg(long, value_name = "MS")]
    pub wait_after: Option<u64>,

    /// Snapshot while the action is still in flight instead of after it
    #[arg(long)]
    pub mid_capture: bool,

    /// Delay before the mid-action snapshot [default: 50]
    #[arg(long, value_name = "MS")]
    pub mid_delay: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Click,
    LongClick,
    Swipe,
    Text,
    Back,
}

impl ActionArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionArg::Click => "click",
            ActionArg::LongClick => "long_click",
            ActionArg::Swipe => "swipe",
            ActionArg::Text => "text",
            ActionArg::Back => "back",
        }
    }
}

/// How to reach the device and where to put the output. Every option has
/// an env fallback so the auto-started daemon can be configured too:
/// `TAPCAP_ADB`, `TAPCAP_SERIAL`, `TAPCAP_AGENT_URL`, `TAPCAP_OUT_DIR`.
#[derive(Debug, Clone, clap::Args)]
pub struct DeviceArgs {
    /// Path to the adb binary
    #[arg(long, value_name = "PATH")]
    pub adb: Option<String>,

    /// Device serial, as shown by 'adb devices'
    #[arg(short, long)]
    pub serial: Option<String>,

    /// Base URL of an on-device HTTP agent; replaces adb when set
    #[arg(long, value_name = "URL")]
    pub agent_url: Option<String>,

    /// Output directory for images, dumps, and the ledger
    #[arg(long, value_name = "DIR")]
    pub out: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ListenArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Input device node to stream, e.g. /dev/input/event4 [default: autodetect]
    #[arg(long, value_name = "NODE")]
    pub device_node: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{ActionArg, Cli, Commands};

    #[test]
    fn capture_parses_negative_deltas() {
        let cli = Cli::parse_from([
            "tapcap", "capture", "swipe", "--bounds", "[0,0][10,10]", "--dx", "0", "--dy", "-500",
        ]);
        match cli.command {
            Commands::Capture(args) => {
                assert!(matches!(args.action, ActionArg::Swipe));
                assert_eq!(args.dy, Some(-500));
            }
            _ => panic!("Expected capture command"),
        }
    }

    #[test]
    fn listen_accepts_device_node() {
        let cli = Cli::parse_from(["tapcap", "listen", "--device-node", "/dev/input/event4"]);
        match cli.command {
            Commands::Listen(args) => {
                assert_eq!(args.device_node.as_deref(), Some("/dev/input/event4"));
            }
            _ => panic!("Expected listen command"),
        }
    }

    #[test]
    fn action_names_match_wire_aliases() {
        assert_eq!(ActionArg::LongClick.as_str(), "long_click");
        assert_eq!(ActionArg::Back.as_str(), "back");
    }
}
