// MP3fy - Audio Transcode and Tag Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! JNI natives for `tech.smallwonder.mp3fy.MP3fy`
//!
//! # Architecture
//! Java (MP3fy) → JNI → Rust [`Engine`]
//!
//! # Design Patterns
//! 1. **One Engine**: a process-wide engine is built on first use
//! 2. **Sentinels**: failures surface as `-1`, `false`, or `null`, exactly
//!    as the Java class expects; the typed error is logged
//! 3. **No Panics**: every entry point runs under `catch_unwind`
//!
//! Java-side threading (`convertAsync`, `getAllMetadataAsync`) stays in
//! Java; these natives are all blocking.

use crate::audio::metadata::AlbumArt;
use crate::engine::Engine;
use crate::error::{Mp3fyError, Result};
use crate::session::INVALID_HANDLE;
use jni::objects::{JByteArray, JObject, JObjectArray, JString, JValue};
use jni::sys::{jboolean, jint, jlong, jobject, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info, warn};

lazy_static::lazy_static! {
    static ref ENGINE: Option<Engine> = match Engine::with_defaults() {
        Ok(engine) => Some(engine),
        Err(e) => {
            error!(error = %e, "Failed to start MP3fy engine");
            None
        }
    };
}

const HASH_MAP: &str = "java/util/HashMap";
const AUDIO_FILE_INFO: &str = "tech/smallwonder/mp3fy/AudioFileInfo";

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn engine() -> Result<&'static Engine> {
    ENGINE
        .as_ref()
        .ok_or_else(|| Mp3fyError::internal("engine unavailable"))
}

fn jni_err(err: jni::errors::Error) -> Mp3fyError {
    Mp3fyError::internal(format!("JNI: {}", err))
}

fn jstring_to_string(env: &mut JNIEnv, jstr: &JString) -> Result<String> {
    env.get_string(jstr)
        .map(|s| s.into())
        .map_err(|e| Mp3fyError::InvalidInput(format!("JNI string conversion failed: {}", e)))
}

/// Run `f`, turning a panic into `fallback`
fn catch_panic<T, F>(fallback: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error!("Rust panic in JNI call: {}", panic_msg);
            fallback
        }
    }
}

fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// `Result<jobject>` → object or `null`, logging the error
fn object_or_null(result: Result<jobject>, operation: &str) -> jobject {
    result.unwrap_or_else(|e| {
        warn!(operation, error = %e, "JNI call failed");
        JObject::null().into_raw()
    })
}

fn new_hash_map<'local>(
    env: &mut JNIEnv<'local>,
    fields: &BTreeMap<String, String>,
) -> Result<JObject<'local>> {
    let map = env.new_object(HASH_MAP, "()V", &[]).map_err(jni_err)?;
    for (key, value) in fields {
        let k = env.new_string(key).map_err(jni_err)?;
        let v = env.new_string(value).map_err(jni_err)?;
        env.call_method(
            &map,
            "put",
            "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
            &[JValue::Object(&k), JValue::Object(&v)],
        )
        .map_err(jni_err)?;
        env.delete_local_ref(k).map_err(jni_err)?;
        env.delete_local_ref(v).map_err(jni_err)?;
    }
    Ok(map)
}

/// `android.graphics.Bitmap` in ARGB_8888
fn new_bitmap<'local>(env: &mut JNIEnv<'local>, art: &AlbumArt) -> Result<JObject<'local>> {
    let argb = art.to_argb_pixels();
    let len = jint::try_from(argb.len())
        .map_err(|_| Mp3fyError::ImageFailure("album art too large".to_string()))?;
    let colors = env.new_int_array(len).map_err(jni_err)?;
    env.set_int_array_region(&colors, 0, &argb).map_err(jni_err)?;

    let config = env
        .get_static_field(
            "android/graphics/Bitmap$Config",
            "ARGB_8888",
            "Landroid/graphics/Bitmap$Config;",
        )
        .and_then(|v| v.l())
        .map_err(jni_err)?;

    env.call_static_method(
        "android/graphics/Bitmap",
        "createBitmap",
        "([IIILandroid/graphics/Bitmap$Config;)Landroid/graphics/Bitmap;",
        &[
            JValue::Object(&colors),
            JValue::Int(art.width as jint),
            JValue::Int(art.height as jint),
            JValue::Object(&config),
        ],
    )
    .and_then(|v| v.l())
    .map_err(jni_err)
}

fn string_array(env: &mut JNIEnv, array: &JObjectArray, length: jint) -> Result<Vec<String>> {
    if array.is_null() {
        return Ok(Vec::new());
    }
    let available = env.get_array_length(array).map_err(jni_err)?;
    let count = length.clamp(0, available);

    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let element = env.get_object_array_element(array, i).map_err(jni_err)?;
        let jstr = JString::from(element);
        out.push(jstring_to_string(env, &jstr)?);
        env.delete_local_ref(jstr).map_err(jni_err)?;
    }
    Ok(out)
}

/// Java compresses the bitmap before calling; raw RGBA is accepted too
fn album_art_from_java(
    env: &mut JNIEnv,
    bytes: &JByteArray,
    length: jint,
    width: jint,
    height: jint,
) -> Result<Option<AlbumArt>> {
    if bytes.is_null() || length <= 0 {
        return Ok(None);
    }
    let mut data = env.convert_byte_array(bytes).map_err(jni_err)?;
    data.truncate(length as usize);

    let raw_len = width.max(0) as usize * height.max(0) as usize * 4;
    if raw_len > 0 && data.len() == raw_len {
        if let Ok(art) = AlbumArt::from_encoded(data.clone()) {
            return Ok(Some(art));
        }
        return AlbumArt::from_rgba(width as u32, height as u32, data).map(Some);
    }
    AlbumArt::from_encoded(data).map(Some)
}

// ============================================================================
// SESSION FUNCTIONS
// ============================================================================

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_initializeNative<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    input_file: JString<'local>,
    output_file: JString<'local>,
) -> jlong {
    catch_panic(INVALID_HANDLE, || {
        let paths = jstring_to_string(&mut env, &input_file)
            .and_then(|input| Ok((input, jstring_to_string(&mut env, &output_file)?)));
        match (engine(), paths) {
            (Ok(engine), Ok((input, output))) => engine.initialize(input, output),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "initializeNative failed");
                INVALID_HANDLE
            }
        }
    })
}

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_convertNative<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    media_id: jlong,
) -> jboolean {
    catch_panic(JNI_FALSE, || {
        to_jboolean(engine().map(|e| e.convert(media_id)).unwrap_or(false))
    })
}

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_getPercentageNative<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    media_id: jlong,
) -> jint {
    catch_panic(-1, || {
        engine().map(|e| e.get_percentage(media_id)).unwrap_or(-1)
    })
}

// ============================================================================
// METADATA FUNCTIONS
// ============================================================================

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_getAllMetadataNative<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
) -> jobject {
    catch_panic(JObject::null().into_raw(), || {
        let result = (|| -> Result<jobject> {
            let path = jstring_to_string(&mut env, &path)?;
            let fields = engine()?.get_all_metadata(path);
            Ok(new_hash_map(&mut env, &fields)?.into_raw())
        })();
        object_or_null(result, "getAllMetadataNative")
    })
}

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_getAlbumArtNative<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
) -> jobject {
    catch_panic(JObject::null().into_raw(), || {
        let result = (|| -> Result<jobject> {
            let path = jstring_to_string(&mut env, &path)?;
            match engine()?.get_album_art(path) {
                Some(art) => Ok(new_bitmap(&mut env, &art)?.into_raw()),
                None => Ok(JObject::null().into_raw()),
            }
        })();
        object_or_null(result, "getAlbumArtNative")
    })
}

#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_getAudioFileInfoNative<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
) -> jobject {
    catch_panic(JObject::null().into_raw(), || {
        let result = (|| -> Result<jobject> {
            let path = jstring_to_string(&mut env, &path)?;
            let Some(info) = engine()?.get_audio_file_info(path) else {
                return Ok(JObject::null().into_raw());
            };

            let object = env.new_object(AUDIO_FILE_INFO, "()V", &[]).map_err(jni_err)?;
            let map = new_hash_map(&mut env, &info.metadata.fields)?;
            env.set_field(&object, "metadataList", "Ljava/util/HashMap;", JValue::Object(&map))
                .map_err(jni_err)?;
            if let Some(art) = &info.metadata.album_art {
                let bitmap = new_bitmap(&mut env, art)?;
                env.set_field(&object, "albumArt", "Landroid/graphics/Bitmap;", JValue::Object(&bitmap))
                    .map_err(jni_err)?;
            }
            let bitrate = jint::try_from(info.bitrate_bps).unwrap_or(jint::MAX);
            env.set_field(&object, "bitrate", "I", JValue::Int(bitrate))
                .map_err(jni_err)?;
            let duration = jlong::try_from(info.duration_micros).unwrap_or(jlong::MAX);
            env.set_field(&object, "duration", "J", JValue::Long(duration))
                .map_err(jni_err)?;

            Ok(object.into_raw())
        })();
        object_or_null(result, "getAudioFileInfoNative")
    })
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_editMetadataInformationNative<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    input_file: JString<'local>,
    keys: JObjectArray<'local>,
    values: JObjectArray<'local>,
    length: jint,
    album_art: JByteArray<'local>,
    album_art_len: jint,
    width: jint,
    height: jint,
    output_file: JString<'local>,
) -> jboolean {
    catch_panic(JNI_FALSE, || {
        let result = (|| -> Result<bool> {
            let input = jstring_to_string(&mut env, &input_file)?;
            let output = jstring_to_string(&mut env, &output_file)?;
            let keys = string_array(&mut env, &keys, length)?;
            let values = string_array(&mut env, &values, length)?;
            let art = album_art_from_java(&mut env, &album_art, album_art_len, width, height)?;

            let fields = keys.into_iter().zip(values);
            Ok(engine()?.edit_metadata_information(input, fields, art, output))
        })();
        match result {
            Ok(done) => to_jboolean(done),
            Err(e) => {
                warn!(error = %e, "editMetadataInformationNative failed");
                JNI_FALSE
            }
        }
    })
}

// ============================================================================
// LOGGING
// ============================================================================

/// Route engine logging into logcat
///
/// stderr is discarded on Android, so events are written through liblog
/// under the `MP3Fy` tag.
#[no_mangle]
pub extern "system" fn Java_tech_smallwonder_mp3fy_MP3fy_pipeStdErrToLogcatNative<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
) {
    catch_panic((), || {
        if crate::logging::init_logcat_logging("mp3fy=debug") {
            info!("Logging to logcat");
        }
    })
}
