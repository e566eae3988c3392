//! Small always-available input window.
//!
//! Enter speaks the typed text; the checkboxes toggle always-on-top and
//! the global hotkey listener. Dragging any empty area moves the window.

use std::path::PathBuf;
use std::time::Duration;

use eframe::egui;
use tokio::sync::watch;
use tracing::error;

use crate::config::VoiceConfig;
use crate::hotkey::HotkeyManager;
use crate::speaker::{SpeakStatus, Speaker};

pub struct TtsApp {
    speaker: Speaker,
    hotkeys: HotkeyManager,
    config_path: Option<PathBuf>,
    status: watch::Receiver<SpeakStatus>,
    text: String,
    always_on_top: bool,
    hotkeys_enabled: bool,
    focus_pending: bool,
}

impl TtsApp {
    pub fn new(
        speaker: Speaker,
        mut hotkeys: HotkeyManager,
        config_path: Option<PathBuf>,
        enable_hotkeys: bool,
    ) -> Self {
        if enable_hotkeys {
            hotkeys.start();
        }
        Self {
            status: speaker.subscribe(),
            hotkeys_enabled: hotkeys.is_running(),
            speaker,
            hotkeys,
            config_path,
            text: String::new(),
            always_on_top: false,
            focus_pending: true,
        }
    }

    fn submit(&mut self) {
        let text = self.text.trim();
        if !text.is_empty() {
            self.speaker.speak(text);
        }
        self.text.clear();
    }

    fn set_hotkeys(&mut self, enabled: bool) {
        if enabled {
            self.hotkeys.start();
        } else {
            self.hotkeys.stop();
        }
        self.hotkeys_enabled = self.hotkeys.is_running();
    }

    /// Re-read the shortcut file and the voice config. A broken voice config
    /// keeps the current one.
    fn reload(&mut self) {
        self.hotkeys.reload();
        match VoiceConfig::load(self.config_path.as_deref()) {
            Ok(voice) => self.speaker.set_voice_config(voice),
            Err(e) => error!("Keeping current voice config: {e}"),
        }
        self.hotkeys_enabled = self.hotkeys.is_running();
    }
}

impl eframe::App for TtsApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::CentralPanel::default().show(ctx, |ui| {
            // Registered first so every widget below takes priority over it.
            let background = ui.interact(
                ui.max_rect(),
                egui::Id::new("window-drag"),
                egui::Sense::drag(),
            );
            if background.drag_started() {
                ctx.send_viewport_cmd(egui::ViewportCommand::StartDrag);
            }

            ui.vertical_centered(|ui| {
                ui.label("Type here to speak");

                let input = ui.add(
                    egui::TextEdit::singleline(&mut self.text).desired_width(180.0),
                );
                if self.focus_pending {
                    input.request_focus();
                    self.focus_pending = false;
                }
                if input.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                    self.submit();
                    input.request_focus();
                }

                if ui.checkbox(&mut self.always_on_top, "Always on top").changed() {
                    let level = if self.always_on_top {
                        egui::WindowLevel::AlwaysOnTop
                    } else {
                        egui::WindowLevel::Normal
                    };
                    ctx.send_viewport_cmd(egui::ViewportCommand::WindowLevel(level));
                }

                // The listener can die on its own when keyboards disappear.
                self.hotkeys_enabled = self.hotkeys.is_running();
                let mut enabled = self.hotkeys_enabled;
                if ui.checkbox(&mut enabled, "Enable hotkeys").changed() {
                    self.set_hotkeys(enabled);
                }

                if ui.small_button("Reload config").clicked() {
                    self.reload();
                }

                ui.small(self.status.borrow().to_string());
            });
        });

        // Status updates arrive from background tasks.
        ctx.request_repaint_after(Duration::from_millis(250));
    }
}

/// Open the window and block until it is closed.
pub fn run(
    speaker: Speaker,
    hotkeys: HotkeyManager,
    config_path: Option<PathBuf>,
    enable_hotkeys: bool,
) -> eframe::Result {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("tts")
            .with_inner_size([220.0, 150.0])
            .with_resizable(false),
        ..Default::default()
    };

    eframe::run_native(
        "tts",
        options,
        Box::new(move |_cc| {
            Ok(Box::new(TtsApp::new(
                speaker,
                hotkeys,
                config_path,
                enable_hotkeys,
            )))
        }),
    )
}
