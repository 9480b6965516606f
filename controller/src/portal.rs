use serde::Deserialize;

use dimmer_common::PortalForm;

/// Submission payload from the setup page: the editable configuration
/// fields plus the WiFi credentials, which are consumed by the network
/// layer and never stored in the device configuration.
#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    #[serde(flatten)]
    pub form: PortalForm,
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: String,
}

/// Captive portal page served during SETUP on both platforms.
pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Dimmer Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:680px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}.row>div.pin{flex:0 0 6rem}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Dimmer Setup</h1>
  <p class="muted">Name the device, connect it to your network, and assign output pins.</p>

  <div class="card">
    <h2>Device</h2>
    <label>Device Name</label><input id="deviceName" type="text" maxlength="32">
    <label><input id="invert" type="checkbox"> Invert PWM Output</label>
  </div>

  <div class="card">
    <h2>Network</h2>
    <label>WiFi SSID</label><input id="wifiSsid" type="text">
    <label>WiFi Password</label><input id="wifiPass" type="password">
  </div>

  <div class="card">
    <h2>Update Service</h2>
    <label>Username (blank disables authentication)</label><input id="otaUsername" type="text" maxlength="32">
    <label>Password</label><input id="otaPassword" type="password" maxlength="32">
  </div>

  <div class="card">
    <h2>Lights</h2>
    <div id="channels"></div>
  </div>

  <button id="save">Save and Connect</button>
  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    function channelRow(i,channel){
      const row=document.createElement('div');
      row.className='row';
      row.innerHTML='<div><label>Light '+i+' Name</label><input class="chName" type="text" maxlength="32"></div>'
        +'<div class="pin"><label>Pin</label><input class="chPin" type="text" maxlength="3"></div>';
      row.querySelector('.chName').value=channel.name||'';
      row.querySelector('.chPin').value=channel.pin||'0';
      return row;
    }

    async function load(){
      const r=await fetch('/api/setup');
      const form=await r.json();
      q('deviceName').value=form.deviceName||'';
      q('invert').checked=form.invertPwmOutput==='T';
      q('otaUsername').value=form.otaUsername||'';
      q('otaPassword').value=form.otaPassword||'';
      const holder=q('channels');
      (form.channels||[]).forEach((channel,i)=>holder.appendChild(channelRow(i,channel)));
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      const channels=[...document.querySelectorAll('#channels .row')].map(row=>({
        name:row.querySelector('.chName').value,
        pin:row.querySelector('.chPin').value,
      }));
      const payload={
        deviceName:q('deviceName').value,
        invertPwmOutput:q('invert').checked?'T':'',
        otaUsername:q('otaUsername').value,
        otaPassword:q('otaPassword').value,
        channels,
        wifiSsid:q('wifiSsid').value,
        wifiPass:q('wifiPass').value,
      };
      try{
        const r=await fetch('/api/setup',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        if(!r.ok)throw new Error('Request failed: '+r.status);
        q('status').className='ok'; q('status').textContent='Saved. The device is connecting to your network.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;
