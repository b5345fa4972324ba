//! tun device creation and bring-up.
//!
//! Mirrors `Tun_create`: open `/dev/net/tun`, attach via `TUNSETIFF` with
//! `IFF_TUN | IFF_NO_PI` (no per-packet protocol header, since the
//! protocol is known from which raw socket or tunnel the packet
//! belongs to), then bring the interface up through a throwaway
//! `AF_INET`/`SOCK_DGRAM` socket and `SIOCSIFFLAGS`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};

const TUN_DEV_PATH: &str = "/dev/net/tun";

#[repr(C)]
struct IfReqFlags {
    name: [libc::c_uchar; libc::IF_NAMESIZE],
    flags: libc::c_short,
}

/// An open `/dev/net/tun` descriptor, already attached and up.
pub struct TunDevice {
    file: File,
    name: String,
}

impl TunDevice {
    /// Creates (or attaches to, if `requested_name` already exists) a
    /// tun interface and brings it up.
    pub fn create(requested_name: Option<&str>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(TUN_DEV_PATH)?;

        let mut req = IfReqFlags {
            name: [0u8; libc::IF_NAMESIZE],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
        };
        if let Some(requested_name) = requested_name {
            write_name(&mut req.name, requested_name)?;
        }

        // Safety: `file` is a freshly opened tun clone device and `req`
        // is a valid, correctly sized `ifreq`-compatible struct.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = read_name(&req.name);
        bring_up(&name)?;

        Ok(Self { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

fn bring_up(name: &str) -> io::Result<()> {
    // Safety: a throwaway UDP socket just to carry the SIOC* ioctls; no
    // resource beyond the fd is held.
    let dummy = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if dummy < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut req = IfReqFlags {
        name: [0u8; libc::IF_NAMESIZE],
        flags: 0,
    };
    write_name(&mut req.name, name)?;

    let result = (|| -> io::Result<()> {
        // Safety: `dummy` is an open socket, `req` a valid ifreq.
        if unsafe { libc::ioctl(dummy, SIOCGIFFLAGS, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        req.flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        // Safety: same as above.
        if unsafe { libc::ioctl(dummy, SIOCSIFFLAGS, &mut req) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    })();

    // Safety: `dummy` was opened above and is not used after this point.
    unsafe { libc::close(dummy) };

    result
}

fn write_name(dst: &mut [libc::c_uchar; libc::IF_NAMESIZE], name: &str) -> io::Result<()> {
    let cname = CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains a NUL byte"))?;
    let bytes = cname.as_bytes_with_nul();
    if bytes.len() > dst.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_name(src: &[libc::c_uchar; libc::IF_NAMESIZE]) -> String {
    // Safety: `src` is always NUL-terminated; the kernel writes the
    // chosen interface name back into this field.
    let cstr = unsafe { std::ffi::CStr::from_ptr(src.as_ptr() as *const libc::c_char) };
    cstr.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_name_rejects_oversized_name() {
        let mut buf = [0u8; libc::IF_NAMESIZE];
        let too_long = "x".repeat(libc::IF_NAMESIZE + 1);
        assert!(write_name(&mut buf, &too_long).is_err());
    }

    #[test]
    fn write_then_read_name_round_trips() {
        let mut buf = [0u8; libc::IF_NAMESIZE];
        write_name(&mut buf, "tun7").unwrap();
        assert_eq!(read_name(&buf), "tun7");
    }
}
