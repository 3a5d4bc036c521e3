//! Windows service hosting
//!
//! Registers the server with the Service Control Manager so it can run
//! headless, and provides `install` / `uninstall` helpers. Stop and
//! shutdown controls are translated into the same cancellation token the
//! console mode uses.

#![cfg(windows)]

use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use windows::Win32::System::Services::*;
use windows::core::{PCWSTR, w};

use crate::config::ServerConfig;

/// Stop token shared with the SCM handler callback.
static STOP_TOKEN: OnceLock<CancellationToken> = OnceLock::new();
static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

const SERVICE_NAME: PCWSTR = w!("usbipd");
const SERVICE_DISPLAY: PCWSTR = w!("USB/IP Device Server");
const SERVICE_DESCRIPTION_TEXT: PCWSTR =
    w!("Exports shared USB devices to remote USB/IP clients");

/// Run the process as a Windows service (called when launched by the SCM)
pub fn run_as_service(config: ServerConfig) -> anyhow::Result<()> {
    let _ = CONFIG.set(config);

    unsafe {
        let table = [
            SERVICE_TABLE_ENTRYW {
                lpServiceName: windows::core::PWSTR(SERVICE_NAME.as_ptr().cast_mut()),
                lpServiceProc: Some(service_main),
            },
            SERVICE_TABLE_ENTRYW {
                lpServiceName: windows::core::PWSTR(std::ptr::null_mut()),
                lpServiceProc: None,
            },
        ];
        StartServiceCtrlDispatcherW(table.as_ptr())
            .map_err(|e| anyhow::anyhow!("StartServiceCtrlDispatcher failed: {e}"))?;
    }
    Ok(())
}

/// Install the service into the SCM
pub fn install() -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let exe_path: Vec<u16> = exe
        .as_os_str()
        .to_string_lossy()
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let scm = OpenSCManagerW(None, None, SC_MANAGER_CREATE_SERVICE)?;
        let result = CreateServiceW(
            scm,
            SERVICE_NAME,
            SERVICE_DISPLAY,
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_AUTO_START,
            SERVICE_ERROR_NORMAL,
            PCWSTR(exe_path.as_ptr()),
            None,
            None,
            None,
            None,
            None,
        );
        match result {
            Ok(svc) => {
                let desc = SERVICE_DESCRIPTIONW {
                    lpDescription: windows::core::PWSTR(
                        SERVICE_DESCRIPTION_TEXT.as_ptr().cast_mut(),
                    ),
                };
                let _ = ChangeServiceConfig2W(
                    svc,
                    SERVICE_CONFIG_DESCRIPTION,
                    Some(&desc as *const _ as *const std::ffi::c_void),
                );
                let _ = CloseServiceHandle(svc);
                info!("service installed");
            }
            Err(e) => {
                let _ = CloseServiceHandle(scm);
                return Err(anyhow::anyhow!("CreateService failed: {e}"));
            }
        }
        let _ = CloseServiceHandle(scm);
    }
    Ok(())
}

/// Remove the service from the SCM
pub fn uninstall() -> anyhow::Result<()> {
    unsafe {
        let scm = OpenSCManagerW(None, None, SC_MANAGER_CONNECT)?;
        let svc = match OpenServiceW(scm, SERVICE_NAME, SERVICE_ALL_ACCESS) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = CloseServiceHandle(scm);
                return Err(anyhow::anyhow!("OpenService failed: {e}"));
            }
        };

        let mut status = SERVICE_STATUS::default();
        let _ = ControlService(svc, SERVICE_CONTROL_STOP, &mut status);

        DeleteService(svc).map_err(|e| anyhow::anyhow!("DeleteService failed: {e}"))?;
        info!("service uninstalled");

        let _ = CloseServiceHandle(svc);
        let _ = CloseServiceHandle(scm);
    }
    Ok(())
}

unsafe extern "system" fn service_main(_argc: u32, _argv: *mut windows::core::PWSTR) {
    let status_handle =
        match unsafe { RegisterServiceCtrlHandlerW(SERVICE_NAME, Some(ctrl_handler)) } {
            Ok(handle) => handle,
            Err(e) => {
                error!("RegisterServiceCtrlHandler failed: {e}");
                return;
            }
        };

    report_status(status_handle, SERVICE_START_PENDING, 0, 3000);

    let token = CancellationToken::new();
    let _ = STOP_TOKEN.set(token.clone());
    let config = CONFIG.get().cloned().unwrap_or_default();

    report_status(status_handle, SERVICE_RUNNING, 0, 0);

    let outcome = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(crate::serve(config, token)));
    if let Err(e) = outcome {
        error!("service error: {e:#}");
    }

    report_status(status_handle, SERVICE_STOPPED, 0, 0);
}

unsafe extern "system" fn ctrl_handler(control: u32) {
    match control {
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            if let Some(token) = STOP_TOKEN.get() {
                token.cancel();
            }
        }
        SERVICE_CONTROL_INTERROGATE => {}
        _ => {}
    }
}

fn report_status(
    handle: SERVICE_STATUS_HANDLE,
    state: SERVICE_STATUS_CURRENT_STATE,
    exit_code: u32,
    wait_hint: u32,
) {
    let status = SERVICE_STATUS {
        dwServiceType: SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: state,
        dwControlsAccepted: if state == SERVICE_RUNNING {
            SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN
        } else {
            SERVICE_ACCEPT_STOP
        },
        dwWin32ExitCode: exit_code,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: wait_hint,
    };
    unsafe {
        let _ = SetServiceStatus(handle, &status);
    }
}
