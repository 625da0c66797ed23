mod core;

use crate::core::commands::*;
use tauri::Manager;

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let handle = app.handle();
            let state = AppState::new(&handle)?;
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            sam_submit_frame,
            sam_capture_preview,
            sam_segment,
            sam_select_mask_candidate,
            sam_apply_mask,
            sam_cancel_mask,
            sam_initialize_provider,
            sam_dispose_provider,
            sam_get_provider_status,
            sam_are_models_cached,
            sam_get_model_download_info,
            sam_get_capabilities,
            sam_get_settings,
            sam_set_settings
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
