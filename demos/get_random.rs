/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Ask the TPM behind a resource manager for random bytes.
//!
//! ```text
//! cargo run --example get_random -- "bus_type=session"
//! cargo run --example get_random -- "host=10.0.0.2,tls=yes,verify=log-and-accept"
//! ```

use std::env;
use std::error::Error;

use tracing_subscriber::EnvFilter;
use tss_tcti_rm::header::TPM_ST_NO_SESSIONS;
use tss_tcti_rm::{ResponseHeader, TctiConfig, TctiContext, TctiError, TIMEOUT_BLOCK};

const TPM_CC_GET_RANDOM: u32 = 0x0000_017B;
const RECEIVE_TIMEOUT_MS: i32 = 1000;

fn get_random_command(count: u16) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(12);
    cmd.extend_from_slice(&TPM_ST_NO_SESSIONS.to_be_bytes());
    cmd.extend_from_slice(&12u32.to_be_bytes());
    cmd.extend_from_slice(&TPM_CC_GET_RANDOM.to_be_bytes());
    cmd.extend_from_slice(&count.to_be_bytes());
    cmd
}

fn receive(ctx: &mut TctiContext) -> Result<Vec<u8>, TctiError> {
    let size = ctx.receive(None, TIMEOUT_BLOCK)?;
    let mut response = vec![0u8; size];
    loop {
        match ctx.receive(Some(&mut response), RECEIVE_TIMEOUT_MS) {
            Ok(n) => {
                response.truncate(n);
                return Ok(response);
            }
            Err(TctiError::TryAgain) => println!("still waiting..."),
            Err(e) => return Err(e),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let conf = env::args().nth(1).unwrap_or_default();
    let config: TctiConfig = conf.parse()?;
    println!("Connecting with {:?}", config);

    let mut ctx = TctiContext::connect(&config)?;
    println!("Session id: 0x{:016x}", ctx.session_id());

    ctx.transmit(&get_random_command(16))?;
    let response = receive(&mut ctx)?;

    let header = ResponseHeader::from_slice(&response).ok_or("short response")?;
    if header.code != 0 {
        return Err(format!("TPM returned 0x{:08x}", header.code).into());
    }
    // TPM2B_DIGEST: u16 size followed by the bytes
    let random = response.get(12..).unwrap_or_default();
    println!("Random bytes: {:02x?}", random);

    ctx.finalize();
    Ok(())
}
