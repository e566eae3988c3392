//! Global hotkeys that speak pre-configured phrases.
//!
//! Shortcuts use `<modifier>+key` notation (e.g. `<ctrl>+<alt>+1`). The
//! listener monitors every keyboard via evdev and calls the speaker when a
//! press completes exactly the keys of a bound combination.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use evdev::{Device, EventType, InputEventKind, Key};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{load_shortcuts, ShortcutEntry};
use crate::error::HotkeyError;
use crate::speaker::Speaker;

/// Resolve one shortcut token to the keys that satisfy it.
fn resolve_token(token: &str) -> Option<Vec<Key>> {
    let keys = match token {
        "<ctrl>" => vec![Key::KEY_LEFTCTRL, Key::KEY_RIGHTCTRL],
        "<ctrl_l>" => vec![Key::KEY_LEFTCTRL],
        "<ctrl_r>" => vec![Key::KEY_RIGHTCTRL],
        "<shift>" => vec![Key::KEY_LEFTSHIFT, Key::KEY_RIGHTSHIFT],
        "<shift_l>" => vec![Key::KEY_LEFTSHIFT],
        "<shift_r>" => vec![Key::KEY_RIGHTSHIFT],
        "<alt>" => vec![Key::KEY_LEFTALT, Key::KEY_RIGHTALT],
        "<alt_l>" => vec![Key::KEY_LEFTALT],
        "<alt_r>" | "<alt_gr>" => vec![Key::KEY_RIGHTALT],
        "<cmd>" | "<super>" | "<meta>" => vec![Key::KEY_LEFTMETA, Key::KEY_RIGHTMETA],
        "<space>" => vec![Key::KEY_SPACE],
        "<enter>" => vec![Key::KEY_ENTER],
        "<tab>" => vec![Key::KEY_TAB],
        "<esc>" => vec![Key::KEY_ESC],
        "<backspace>" => vec![Key::KEY_BACKSPACE],
        "<delete>" => vec![Key::KEY_DELETE],
        "<insert>" => vec![Key::KEY_INSERT],
        "<home>" => vec![Key::KEY_HOME],
        "<end>" => vec![Key::KEY_END],
        "<page_up>" => vec![Key::KEY_PAGEUP],
        "<page_down>" => vec![Key::KEY_PAGEDOWN],
        "<up>" => vec![Key::KEY_UP],
        "<down>" => vec![Key::KEY_DOWN],
        "<left>" => vec![Key::KEY_LEFT],
        "<right>" => vec![Key::KEY_RIGHT],
        "<f1>" => vec![Key::KEY_F1],
        "<f2>" => vec![Key::KEY_F2],
        "<f3>" => vec![Key::KEY_F3],
        "<f4>" => vec![Key::KEY_F4],
        "<f5>" => vec![Key::KEY_F5],
        "<f6>" => vec![Key::KEY_F6],
        "<f7>" => vec![Key::KEY_F7],
        "<f8>" => vec![Key::KEY_F8],
        "<f9>" => vec![Key::KEY_F9],
        "<f10>" => vec![Key::KEY_F10],
        "<f11>" => vec![Key::KEY_F11],
        "<f12>" => vec![Key::KEY_F12],
        literal => {
            let mut chars = literal.chars();
            let (Some(ch), None) = (chars.next(), chars.next()) else {
                return None;
            };
            vec![resolve_char(ch)?]
        }
    };
    Some(keys)
}

fn resolve_char(ch: char) -> Option<Key> {
    let key = match ch {
        'a' => Key::KEY_A,
        'b' => Key::KEY_B,
        'c' => Key::KEY_C,
        'd' => Key::KEY_D,
        'e' => Key::KEY_E,
        'f' => Key::KEY_F,
        'g' => Key::KEY_G,
        'h' => Key::KEY_H,
        'i' => Key::KEY_I,
        'j' => Key::KEY_J,
        'k' => Key::KEY_K,
        'l' => Key::KEY_L,
        'm' => Key::KEY_M,
        'n' => Key::KEY_N,
        'o' => Key::KEY_O,
        'p' => Key::KEY_P,
        'q' => Key::KEY_Q,
        'r' => Key::KEY_R,
        's' => Key::KEY_S,
        't' => Key::KEY_T,
        'u' => Key::KEY_U,
        'v' => Key::KEY_V,
        'w' => Key::KEY_W,
        'x' => Key::KEY_X,
        'y' => Key::KEY_Y,
        'z' => Key::KEY_Z,
        '0' => Key::KEY_0,
        '1' => Key::KEY_1,
        '2' => Key::KEY_2,
        '3' => Key::KEY_3,
        '4' => Key::KEY_4,
        '5' => Key::KEY_5,
        '6' => Key::KEY_6,
        '7' => Key::KEY_7,
        '8' => Key::KEY_8,
        '9' => Key::KEY_9,
        _ => return None,
    };
    Some(key)
}

/// A parsed shortcut: one group of interchangeable keys per token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    notation: String,
    normalized: String,
    groups: Vec<Vec<Key>>,
}

impl KeyCombo {
    pub fn parse(notation: &str) -> Result<Self, HotkeyError> {
        let lowered = notation.trim().to_lowercase();
        if lowered.is_empty() {
            return Err(HotkeyError::EmptyCombo);
        }

        let mut tokens: Vec<&str> = lowered.split('+').map(str::trim).collect();
        let mut groups = Vec::with_capacity(tokens.len());
        for token in &tokens {
            let keys = resolve_token(token).ok_or_else(|| HotkeyError::UnknownKey {
                combo: notation.to_string(),
                token: (*token).to_string(),
            })?;
            groups.push(keys);
        }

        tokens.sort_unstable();
        tokens.dedup();
        Ok(Self {
            notation: notation.trim().to_string(),
            normalized: tokens.join("+"),
            groups,
        })
    }

    pub fn notation(&self) -> &str {
        &self.notation
    }

    /// Order- and case-insensitive identity of the combination.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// True when the pressed set is exactly this combination: every group has
    /// a key down and no key outside the combination is down.
    fn matches(&self, pressed: &HashSet<Key>) -> bool {
        self.groups
            .iter()
            .all(|group| group.iter().any(|k| pressed.contains(k)))
            && pressed
                .iter()
                .all(|k| self.groups.iter().any(|group| group.contains(k)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotkeyBinding {
    pub combo: KeyCombo,
    pub text: String,
}

/// Parse shortcut entries, skipping bad ones.
///
/// Duplicate combinations keep the position of the first occurrence and
/// the text of the last.
pub fn compile_bindings(entries: &[ShortcutEntry]) -> Vec<HotkeyBinding> {
    let mut bindings: Vec<HotkeyBinding> = Vec::with_capacity(entries.len());
    for entry in entries {
        let combo = match KeyCombo::parse(&entry.key) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping shortcut: {e}");
                continue;
            }
        };

        if let Some(existing) = bindings
            .iter_mut()
            .find(|b| b.combo.normalized() == combo.normalized())
        {
            warn!(
                "Duplicate shortcut '{}' (already bound as '{}'), last one wins",
                entry.key,
                existing.combo.notation()
            );
            existing.combo = combo;
            existing.text = entry.text.clone();
            continue;
        }

        info!("Loaded shortcut: {} -> '{}'", entry.key, entry.text);
        bindings.push(HotkeyBinding {
            combo,
            text: entry.text.clone(),
        });
    }
    bindings
}

/// Pressed-key state shared across all keyboards.
#[derive(Debug, Default)]
struct ComboTracker {
    pressed: HashSet<Key>,
    active: Vec<bool>,
}

impl ComboTracker {
    /// Feed one key event (0 = release, 1 = press, 2 = repeat) and return the
    /// indices of bindings that a press just completed.
    ///
    /// Releases only update state; they never fire a binding.
    fn on_key(&mut self, bindings: &[HotkeyBinding], key: Key, value: i32) -> Vec<usize> {
        let is_press = match value {
            1 => self.pressed.insert(key),
            0 => {
                self.pressed.remove(&key);
                false
            }
            _ => return Vec::new(),
        };

        self.active.resize(bindings.len(), false);
        let mut fired = Vec::new();
        for (i, binding) in bindings.iter().enumerate() {
            let held = binding.combo.matches(&self.pressed);
            if is_press && held && !self.active[i] {
                fired.push(i);
            }
            self.active[i] = held;
        }
        fired
    }
}

/// Find all keyboard input devices.
fn find_keyboards() -> Vec<Device> {
    evdev::enumerate()
        .filter_map(|(_path, device)| {
            let keys = device.supported_keys()?;
            if keys.contains(Key::KEY_A) && keys.contains(Key::KEY_ENTER) {
                info!(
                    "Found keyboard: {} at {:?}",
                    device.name().unwrap_or("unknown"),
                    device.physical_path()
                );
                Some(device)
            } else {
                None
            }
        })
        .collect()
}

/// Monitor a single device for key events.
async fn monitor_device(
    device: Device,
    bindings: Arc<[HotkeyBinding]>,
    tracker: Arc<Mutex<ComboTracker>>,
    speaker: Speaker,
) {
    let name = device.name().unwrap_or("unknown").to_string();
    debug!("Monitoring {name}");

    let mut events = match device.into_event_stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot create event stream for {name}: {e}");
            return;
        }
    };

    loop {
        let event = match events.next_event().await {
            Ok(event) => event,
            Err(e) => {
                warn!("Device {name} disconnected: {e}");
                break;
            }
        };

        if event.event_type() != EventType::KEY {
            continue;
        }
        let InputEventKind::Key(key) = event.kind() else {
            continue;
        };

        let fired = {
            let mut tracker = match tracker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tracker.on_key(&bindings, key, event.value())
        };

        for index in fired {
            let binding = &bindings[index];
            info!(
                "Global Hotkey Triggered: {} -> '{}'",
                binding.combo.notation(),
                binding.text
            );
            speaker.speak(&binding.text);
        }
    }
}

/// Running per-device monitor tasks.
struct Listener {
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    fn start(
        bindings: Arc<[HotkeyBinding]>,
        speaker: &Speaker,
        runtime: &Handle,
    ) -> Result<Self, HotkeyError> {
        let keyboards = find_keyboards();
        if keyboards.is_empty() {
            return Err(HotkeyError::NoKeyboards);
        }

        info!("Monitoring {} keyboard(s)", keyboards.len());
        let tracker = Arc::new(Mutex::new(ComboTracker::default()));
        let tasks = keyboards
            .into_iter()
            .map(|device| {
                runtime.spawn(monitor_device(
                    device,
                    bindings.clone(),
                    tracker.clone(),
                    speaker.clone(),
                ))
            })
            .collect();
        Ok(Self { tasks })
    }

    /// False once every device monitor has exited, e.g. after unplugging.
    fn is_alive(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Owns the shortcut bindings and the listener lifecycle.
pub struct HotkeyManager {
    shortcut_file: PathBuf,
    bindings: Arc<[HotkeyBinding]>,
    speaker: Speaker,
    runtime: Handle,
    listener: Option<Listener>,
}

impl HotkeyManager {
    pub fn new(shortcut_file: impl Into<PathBuf>, speaker: Speaker, runtime: Handle) -> Self {
        let shortcut_file = shortcut_file.into();
        let bindings = compile_bindings(&load_shortcuts(&shortcut_file)).into();
        Self {
            shortcut_file,
            bindings,
            speaker,
            runtime,
            listener: None,
        }
    }

    pub fn shortcut_file(&self) -> &Path {
        &self.shortcut_file
    }

    pub fn bindings(&self) -> &[HotkeyBinding] {
        &self.bindings
    }

    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(Listener::is_alive)
    }

    /// Start listening. Failures are logged and leave the manager stopped.
    pub fn start(&mut self) {
        if self.is_running() {
            info!("Hotkey listener is already running.");
            return;
        }
        // Drop a listener whose monitors have all exited.
        self.stop();
        if self.bindings.is_empty() {
            info!("No valid hotkeys loaded. Listener not started.");
            return;
        }

        match Listener::start(self.bindings.clone(), &self.speaker, &self.runtime) {
            Ok(listener) => {
                self.listener = Some(listener);
                info!("Global hotkey listener started.");
            }
            Err(e) => error!("Failed to start global hotkey listener: {e}"),
        }
    }

    pub fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
            info!("Global hotkey listener stopped.");
        }
    }

    /// Re-read the shortcut file, restarting a running listener if the
    /// bindings changed. Returns whether they changed.
    pub fn reload(&mut self) -> bool {
        let bindings: Arc<[HotkeyBinding]> =
            compile_bindings(&load_shortcuts(&self.shortcut_file)).into();
        let changed = bindings != self.bindings;
        self.bindings = bindings;

        if changed && self.is_running() {
            info!("Shortcut configuration changed. Restarting listener...");
            self.stop();
            self.start();
        }
        changed
    }
}

impl Drop for HotkeyManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceConfig;
    use crate::playback::PlaybackQueue;
    use crate::synth::HttpSynthesizer;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn entry(key: &str, text: &str) -> ShortcutEntry {
        ShortcutEntry {
            key: key.into(),
            text: text.into(),
        }
    }

    fn test_speaker(dir: &Path) -> Speaker {
        let (queue, _rx) = PlaybackQueue::channel();
        Speaker::new(
            VoiceConfig::for_tests(dir),
            Arc::new(HttpSynthesizer::new().unwrap()),
            queue,
            Handle::current(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_parse_modifiers_and_literals() {
        let combo = KeyCombo::parse("<CTRL>+<Alt>+A").unwrap();
        assert_eq!(combo.notation(), "<CTRL>+<Alt>+A");
        assert_eq!(combo.normalized(), "<alt>+<ctrl>+a");
        assert_eq!(
            combo.groups,
            vec![
                vec![Key::KEY_LEFTCTRL, Key::KEY_RIGHTCTRL],
                vec![Key::KEY_LEFTALT, Key::KEY_RIGHTALT],
                vec![Key::KEY_A],
            ]
        );
        assert_eq!(KeyCombo::parse("<f5>").unwrap().groups, vec![vec![Key::KEY_F5]]);
        assert_eq!(KeyCombo::parse("<cmd>+7").unwrap().groups[1], vec![Key::KEY_7]);
    }

    #[test]
    fn test_parse_rejects_unknown_tokens() {
        assert!(matches!(
            KeyCombo::parse("<ctrl>+<hyper>"),
            Err(HotkeyError::UnknownKey { token, .. }) if token == "<hyper>"
        ));
        assert!(matches!(KeyCombo::parse("<ctrl>+ab"), Err(HotkeyError::UnknownKey { .. })));
        assert!(matches!(KeyCombo::parse("<ctrl>+"), Err(HotkeyError::UnknownKey { .. })));
        assert!(matches!(KeyCombo::parse("  "), Err(HotkeyError::EmptyCombo)));
    }

    #[test]
    fn test_duplicate_combo_last_wins() {
        let bindings = compile_bindings(&[
            entry("<ctrl>+a", "first"),
            entry("<f2>", "other"),
            entry("a+<CTRL>", "second"),
            entry("<nope>", "skipped"),
        ]);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].text, "second");
        assert_eq!(bindings[0].combo.notation(), "a+<CTRL>");
        assert_eq!(bindings[1].text, "other");
    }

    #[test]
    fn test_tracker_fires_once_per_press() {
        let bindings = compile_bindings(&[entry("<ctrl>+a", "hi"), entry("<f1>", "help")]);
        let mut tracker = ComboTracker::default();

        assert!(tracker.on_key(&bindings, Key::KEY_RIGHTCTRL, 1).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_A, 1), vec![0]);
        assert!(tracker.on_key(&bindings, Key::KEY_A, 2).is_empty());

        assert!(tracker.on_key(&bindings, Key::KEY_A, 0).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_A, 1), vec![0]);

        assert!(tracker.on_key(&bindings, Key::KEY_A, 0).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_RIGHTCTRL, 0).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_F1, 1), vec![1]);
    }

    #[test]
    fn test_tracker_requires_exact_combo() {
        let bindings = compile_bindings(&[
            entry("<ctrl>+a", "plain"),
            entry("<ctrl>+<shift>+a", "shifted"),
        ]);
        let mut tracker = ComboTracker::default();

        assert!(tracker.on_key(&bindings, Key::KEY_LEFTCTRL, 1).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_LEFTSHIFT, 1).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_A, 1), vec![1]);

        // Dropping shift leaves ctrl+a down, but a release never fires.
        assert!(tracker.on_key(&bindings, Key::KEY_LEFTSHIFT, 0).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_A, 0).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_A, 1), vec![0]);
    }

    #[test]
    fn test_tracker_extra_key_blocks_combo() {
        let bindings = compile_bindings(&[entry("<ctrl>+a", "hi")]);
        let mut tracker = ComboTracker::default();
        assert!(tracker.on_key(&bindings, Key::KEY_LEFTCTRL, 1).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_B, 1).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_A, 1).is_empty());
    }

    #[test]
    fn test_tracker_needs_every_group() {
        let bindings = compile_bindings(&[entry("<ctrl>+<shift>+s", "save")]);
        let mut tracker = ComboTracker::default();
        assert!(tracker.on_key(&bindings, Key::KEY_LEFTCTRL, 1).is_empty());
        assert!(tracker.on_key(&bindings, Key::KEY_S, 1).is_empty());
        assert_eq!(tracker.on_key(&bindings, Key::KEY_RIGHTSHIFT, 1), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_file_gives_empty_bindings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shortcut_key.json");
        fs::write(&path, r#"{"not": "an array"}"#).unwrap();

        let mut manager = HotkeyManager::new(&path, test_speaker(dir.path()), Handle::current());
        assert!(manager.bindings().is_empty());

        manager.start();
        assert!(!manager.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_running_after_monitors_exit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shortcut_key.json");
        fs::write(&path, r#"[{"key": "<ctrl>+a", "text": "one"}]"#).unwrap();

        let mut manager = HotkeyManager::new(&path, test_speaker(dir.path()), Handle::current());
        let pending = tokio::spawn(std::future::pending::<()>());
        manager.listener = Some(Listener {
            tasks: vec![pending],
        });
        assert!(manager.is_running());

        let done = tokio::spawn(async {});
        manager.listener = Some(Listener { tasks: vec![done] });
        for _ in 0..100 {
            if !manager.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_detects_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shortcut_key.json");
        fs::write(&path, r#"[{"key": "<ctrl>+a", "text": "one"}]"#).unwrap();

        let mut manager = HotkeyManager::new(&path, test_speaker(dir.path()), Handle::current());
        assert_eq!(manager.bindings().len(), 1);
        assert!(!manager.reload());

        fs::write(
            &path,
            r#"[{"key": "<ctrl>+a", "text": "uno"}, {"key": "<f3>", "text": "tres"}]"#,
        )
        .unwrap();
        assert!(manager.reload());
        assert_eq!(manager.bindings()[0].text, "uno");
        assert_eq!(manager.bindings().len(), 2);
        assert!(!manager.is_running());
    }
}
