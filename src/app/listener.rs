use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    thread,
};

use log::{debug, warn};

use crate::{error::SupervisorError, models::message::ControlClient};

/// Longest command line accepted; the rest of a longer line is discarded.
const MAX_LINE: u64 = 4096;

pub fn bind(addr: &str) -> Result<TcpListener, SupervisorError> {
    TcpListener::bind(addr).map_err(|source| SupervisorError::Listen {
        addr: addr.to_string(),
        source,
    })
}

/// Accepts connections forever, one thread per connection.
pub fn serve(listener: TcpListener, client: ControlClient) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client = client.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &client) {
                        debug!("control connection closed: {}", e);
                    }
                });
            }
            Err(e) => warn!("failed to accept control connection: {}", e),
        }
    }
}

/// One command per line in, one response line out, until either side closes.
fn handle_connection(stream: TcpStream, client: &ControlClient) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader).take(MAX_LINE).read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') && read as u64 == MAX_LINE {
            reader.skip_until(b'\n')?;
        }

        let command = String::from_utf8_lossy(&line);
        let Ok(response) = client.request(command.trim()) else {
            break;
        };
        writer.write_all(response.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
