use crate::state::SharedState;
use crate::watcher;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

pub async fn serve_hls_file(
    State(state): State<SharedState>,
    Path((stream_id, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. Only registered streams are served, so a stray request cannot
    // probe arbitrary directories under the HLS root
    if !state.supervisor.contains(&stream_id) {
        return Err((StatusCode::NOT_FOUND, "Stream not running".to_string()));
    }
    if file_name.contains("..") || file_name.contains('/') {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }

    // 2. Construct the file path (reading from the configured HLS Root directory, supports RAMDisk)
    let mut file_path = PathBuf::from(&state.config.server.hls_root);
    file_path.push(&stream_id);
    file_path.push(&file_name);

    // 3. The transcoder writes asynchronously with a startup delay, so give
    // playlist requests a short grace period before giving up
    if file_name.ends_with(".m3u8") {
        if let Some(dir) = file_path.parent() {
            watcher::wait_for_ready(dir, Duration::from_secs(3), Duration::from_millis(200)).await;
        }
    }

    // 4. Open the file for reading
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 5. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .unwrap())
}
